//! # Weather Lookup
//!
//! Thin client for the AMap (高德) `weatherInfo` API. Upstream responses are
//! reduced to one of two summaries:
//!
//! - **Live** (`extensions=base`): current conditions
//! - **Forecast** (`extensions=all`): today's high/low from the first forecast day
//!
//! Every failure (network, HTTP status, `status != "1"`, unexpected payload)
//! becomes [`PipelineError::UpstreamWeather`]; the HTTP handler turns it into an
//! `{"error": ...}` body.

use crate::config::WeatherConfig;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Current conditions for a city.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveWeather {
    pub weather: String,
    pub temperature: i32,
    pub wind_direction: String,
    pub wind_power: String,
    pub humidity: i32,
    pub description: String,
    pub city: String,
}

/// Today's forecast for a city.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastWeather {
    pub weather: String,
    pub temperature_high: i32,
    pub temperature_low: i32,
    pub wind_direction: String,
    pub wind_power: String,
    pub description: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WeatherSummary {
    Live(LiveWeather),
    Forecast(ForecastWeather),
}

#[derive(Debug, Deserialize)]
struct AmapResponse {
    status: String,
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    lives: Vec<AmapLive>,
    #[serde(default)]
    forecasts: Vec<AmapForecast>,
}

#[derive(Debug, Deserialize)]
struct AmapLive {
    city: String,
    weather: String,
    temperature: String,
    winddirection: String,
    windpower: String,
    humidity: String,
}

#[derive(Debug, Deserialize)]
struct AmapForecast {
    city: String,
    #[serde(default)]
    casts: Vec<AmapCast>,
}

#[derive(Debug, Deserialize)]
struct AmapCast {
    #[serde(rename = "dayweather", alias = "weather")]
    weather: String,
    daytemp: String,
    nighttemp: String,
    daywind: String,
    daypower: String,
}

fn upstream(message: impl Into<String>) -> PipelineError {
    PipelineError::UpstreamWeather(message.into())
}

/// AMap sends numbers as strings, occasionally with a fractional part.
fn parse_degrees(field: &str, value: &str) -> PipelineResult<i32> {
    let value = value.trim();
    value
        .parse::<i32>()
        .or_else(|_| value.parse::<f64>().map(|v| v.round() as i32))
        .map_err(|_| upstream(format!("malformed {} value '{}'", field, value)))
}

impl AmapResponse {
    fn into_summary(self) -> PipelineResult<WeatherSummary> {
        if self.status != "1" {
            return Err(upstream(format!(
                "upstream rejected the request: {}",
                self.info.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        if let Some(live) = self.lives.into_iter().next() {
            let temperature = parse_degrees("temperature", &live.temperature)?;
            let humidity = parse_degrees("humidity", &live.humidity)?;
            let description = format!(
                "今天是{}，温度{}°C，{}风{}级，湿度{}%",
                live.weather, temperature, live.winddirection, live.windpower, humidity
            );
            return Ok(WeatherSummary::Live(LiveWeather {
                weather: live.weather,
                temperature,
                wind_direction: live.winddirection,
                wind_power: live.windpower,
                humidity,
                description,
                city: live.city,
            }));
        }

        if let Some(forecast) = self.forecasts.into_iter().next() {
            let today = forecast
                .casts
                .into_iter()
                .next()
                .ok_or_else(|| upstream("forecast has no days"))?;
            let high = parse_degrees("daytemp", &today.daytemp)?;
            let low = parse_degrees("nighttemp", &today.nighttemp)?;
            let description = format!(
                "今天是{}，温度{}-{}°C，{}风{}级",
                today.weather, low, high, today.daywind, today.daypower
            );
            return Ok(WeatherSummary::Forecast(ForecastWeather {
                weather: today.weather,
                temperature_high: high,
                temperature_low: low,
                wind_direction: today.daywind,
                wind_power: today.daypower,
                description,
                city: forecast.city,
            }));
        }

        Err(upstream("upstream returned neither live nor forecast data"))
    }
}

pub struct WeatherClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    extensions: String,
    default_city: String,
    timeout: Duration,
}

impl WeatherClient {
    pub fn new(client: reqwest::Client, config: &WeatherConfig) -> Self {
        Self {
            client,
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            extensions: config.extensions.clone(),
            default_city: config.default_city.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Look up the weather for `city` (an adcode), or the configured default city.
    pub async fn lookup(&self, city: Option<&str>) -> PipelineResult<WeatherSummary> {
        if self.api_key.is_empty() {
            return Err(upstream("weather API key is not configured"));
        }
        let city = city
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.default_city);
        debug!(city, "Looking up weather");

        let response = self
            .client
            .get(&self.api_base)
            .query(&[
                ("city", city),
                ("key", self.api_key.as_str()),
                ("extensions", self.extensions.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| upstream(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(upstream(format!("upstream returned {}", response.status())));
        }

        let body: AmapResponse = response
            .json()
            .await
            .map_err(|e| upstream(format!("malformed payload: {}", e)))?;
        body.into_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::spawn_http_server;
    use actix_web::{web, HttpResponse};
    use serde_json::json;

    fn client(base: &str, key: &str) -> WeatherClient {
        let mut config = AppConfig::default().weather;
        config.api_base = format!("{}/v3/weather/weatherInfo", base);
        config.api_key = key.to_string();
        WeatherClient::new(reqwest::Client::new(), &config)
    }

    #[derive(Deserialize)]
    struct Query {
        city: String,
    }

    async fn fake_amap(query: web::Query<Query>) -> HttpResponse {
        match query.city.as_str() {
            "410100" => HttpResponse::Ok().json(json!({
                "status": "1",
                "info": "OK",
                "lives": [{
                    "province": "河南", "city": "郑州市", "adcode": "410100",
                    "weather": "晴", "temperature": "25", "winddirection": "南",
                    "windpower": "≤3", "humidity": "40", "reporttime": "2025-01-01 12:00:00"
                }]
            })),
            "110000" => HttpResponse::Ok().json(json!({
                "status": "1",
                "forecasts": [{
                    "city": "北京市",
                    "casts": [{
                        "date": "2025-01-01", "dayweather": "多云", "nightweather": "晴",
                        "daytemp": "5", "nighttemp": "-3", "daywind": "北", "daypower": "1-3"
                    }]
                }]
            })),
            "000000" => HttpResponse::Ok().json(json!({ "status": "0", "info": "INVALID_USER_KEY" })),
            "999999" => HttpResponse::Ok().json(json!({ "status": "1", "lives": [] })),
            _ => HttpResponse::InternalServerError().finish(),
        }
    }

    fn amap_server() -> String {
        spawn_http_server(|cfg| {
            cfg.route("/v3/weather/weatherInfo", web::get().to(fake_amap));
        })
    }

    #[actix_web::test]
    async fn test_live_weather_summary() {
        let base = amap_server();
        let summary = client(&base, "k").lookup(None).await.unwrap();
        match summary {
            WeatherSummary::Live(live) => {
                assert_eq!(live.city, "郑州市");
                assert_eq!(live.temperature, 25);
                assert_eq!(live.humidity, 40);
                assert_eq!(live.description, "今天是晴，温度25°C，南风≤3级，湿度40%");
            }
            other => panic!("expected live weather, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_forecast_summary() {
        let base = amap_server();
        let summary = client(&base, "k").lookup(Some("110000")).await.unwrap();
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["temperature_high"], 5);
        assert_eq!(value["temperature_low"], -3);
        assert_eq!(value["weather"], "多云");
        assert!(value.get("humidity").is_none());
    }

    #[actix_web::test]
    async fn test_upstream_failures_are_weather_errors() {
        let base = amap_server();
        let client = client(&base, "k");

        for city in ["000000", "999999", "500500"] {
            let err = client.lookup(Some(city)).await.unwrap_err();
            assert!(matches!(err, PipelineError::UpstreamWeather(_)), "city {}", city);
        }
        let err = client.lookup(Some("000000")).await.unwrap_err();
        assert!(err.to_string().contains("INVALID_USER_KEY"));
    }

    #[tokio::test]
    async fn test_missing_key_and_unreachable_upstream() {
        let err = client("http://127.0.0.1:9", "").lookup(None).await.unwrap_err();
        assert_eq!(err, upstream("weather API key is not configured"));

        let err = client("http://127.0.0.1:9", "k").lookup(None).await.unwrap_err();
        assert!(err.to_string().starts_with("weather lookup failed: request failed"));
    }

    #[test]
    fn test_degree_parsing() {
        assert_eq!(parse_degrees("t", "25").unwrap(), 25);
        assert_eq!(parse_degrees("t", " -3 ").unwrap(), -3);
        assert_eq!(parse_degrees("t", "24.6").unwrap(), 25);
        assert!(parse_degrees("t", "hot").is_err());
    }
}
