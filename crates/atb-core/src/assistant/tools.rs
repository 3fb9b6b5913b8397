//! Function tools attached to the assistants the bot creates and executed
//! when a run stops on `requires_action`.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    assistant::types::{AssistantTool, FunctionToolCall, ToolOutput},
    errors::Error,
    utils::iso_timestamp_utc,
    Result,
};

const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[async_trait]
pub trait FunctionTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value) -> Result<String>;
}

/// Tools by name. Unknown names and failing calls still produce an output so
/// a run can always be resumed.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn FunctionTool>>,
}

impl ToolRegistry {
    /// `get_current_time` and `get_weather`.
    pub fn with_defaults(http: reqwest::Client) -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(CurrentTimeTool));
        registry.register(Box::new(WeatherTool::new(http)));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn FunctionTool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Tool list sent when an assistant is created.
    pub fn definitions(&self) -> Vec<AssistantTool> {
        self.tools
            .values()
            .map(|t| AssistantTool::Function {
                function: json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters(),
                }),
            })
            .collect()
    }

    /// One output per call, in call order.
    pub async fn run_all(&self, calls: &[FunctionToolCall]) -> Vec<ToolOutput> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = self.run_one(call).await;
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        outputs
    }

    async fn run_one(&self, call: &FunctionToolCall) -> String {
        let Some(tool) = self.tools.get(call.function.name.as_str()) else {
            tracing::warn!(tool = %call.function.name, "unknown tool requested");
            return json!({"error": "unknown tool"}).to_string();
        };

        let raw = call.function.arguments.trim();
        let args = if raw.is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        let args = match args {
            Ok(args) => args,
            Err(e) => return json!({"error": format!("invalid arguments: {e}")}).to_string(),
        };

        match tool.call(args).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(tool = tool.name(), error = %e, "tool call failed");
                json!({"error": e.to_string()}).to_string()
            }
        }
    }
}

// ============== get_current_time ==============

pub struct CurrentTimeTool;

#[async_trait]
impl FunctionTool for CurrentTimeTool {
    fn name(&self) -> &'static str {
        "get_current_time"
    }

    fn description(&self) -> &'static str {
        "Get the current date and time in UTC (RFC 3339)."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: Value) -> Result<String> {
        Ok(json!({"utc": iso_timestamp_utc()}).to_string())
    }
}

// ============== get_weather ==============

pub struct WeatherTool {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

#[derive(Debug, Deserialize)]
struct WeatherArgs {
    location: String,
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Deserialize)]
struct Place {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: Option<String>,
}

impl WeatherTool {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoints(http, GEOCODING_URL, FORECAST_URL)
    }

    /// Point the tool at other Open-Meteo compatible endpoints.
    pub fn with_endpoints(
        http: reqwest::Client,
        geocoding_url: impl Into<String>,
        forecast_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            geocoding_url: geocoding_url.into(),
            forecast_url: forecast_url.into(),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::External(format!("weather request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::External(format!(
                "weather service returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::External(format!("weather response unreadable: {e}")))
    }
}

#[async_trait]
impl FunctionTool for WeatherTool {
    fn name(&self) -> &'static str {
        "get_weather"
    }

    fn description(&self) -> &'static str {
        "Get the current weather (temperature and wind) for a city or place."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {"type": "string", "description": "City or place name, e.g. Berlin"}
            },
            "required": ["location"]
        })
    }

    async fn call(&self, args: Value) -> Result<String> {
        let args: WeatherArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidInput(format!("location is required: {e}")))?;
        let location = args.location.trim();
        if location.is_empty() {
            return Err(Error::InvalidInput("location is required".to_string()));
        }

        let geo: GeocodingResponse = serde_json::from_value(
            self.get_json(
                &self.geocoding_url,
                &[("name", location.to_string()), ("count", "1".to_string())],
            )
            .await?,
        )?;
        let Some(place) = geo.results.into_iter().next() else {
            return Ok(json!({"error": format!("no place named {location}")}).to_string());
        };

        let forecast = self
            .get_json(
                &self.forecast_url,
                &[
                    ("latitude", place.latitude.to_string()),
                    ("longitude", place.longitude.to_string()),
                    ("current", "temperature_2m,wind_speed_10m".to_string()),
                ],
            )
            .await?;
        Ok(summarize_weather(&place, &forecast).to_string())
    }
}

fn summarize_weather(place: &Place, forecast: &Value) -> Value {
    let current = &forecast["current"];
    let units = &forecast["current_units"];
    json!({
        "location": match &place.country {
            Some(country) => format!("{}, {country}", place.name),
            None => place.name.clone(),
        },
        "time": current["time"],
        "temperature": current["temperature_2m"],
        "temperature_unit": units["temperature_2m"],
        "wind_speed": current["wind_speed_10m"],
        "wind_speed_unit": units["wind_speed_10m"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::types::FunctionCall;

    fn call(id: &str, name: &str, arguments: &str) -> FunctionToolCall {
        FunctionToolCall {
            id: id.to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[test]
    fn definitions_are_function_tools() {
        let registry = ToolRegistry::with_defaults(reqwest::Client::new());
        let defs = serde_json::to_value(registry.definitions()).unwrap();
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "get_current_time");
        assert_eq!(defs[1]["function"]["name"], "get_weather");
        assert_eq!(
            defs[1]["function"]["parameters"]["required"],
            json!(["location"])
        );
    }

    #[tokio::test]
    async fn every_call_gets_an_output() {
        let registry = ToolRegistry::with_defaults(reqwest::Client::new());
        let outputs = registry
            .run_all(&[
                call("a", "get_current_time", ""),
                call("b", "launch_rockets", "{}"),
                call("c", "get_weather", "{not json"),
                call("d", "get_weather", r#"{"location": "  "}"#),
            ])
            .await;

        let ids: Vec<&str> = outputs.iter().map(|o| o.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        let time: Value = serde_json::from_str(&outputs[0].output).unwrap();
        assert!(time["utc"].as_str().unwrap().contains('T'));
        assert_eq!(outputs[1].output, r#"{"error":"unknown tool"}"#);
        assert!(outputs[2].output.contains("invalid arguments"));
        assert!(outputs[3].output.contains("location is required"));
    }

    #[tokio::test]
    async fn unreachable_weather_service_becomes_error_output() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(WeatherTool::with_endpoints(
            reqwest::Client::new(),
            "http://127.0.0.1:9/v1/search",
            "http://127.0.0.1:9/v1/forecast",
        )));
        let outputs = registry
            .run_all(&[call("w", "get_weather", r#"{"location": "Berlin"}"#)])
            .await;

        assert_eq!(outputs.len(), 1);
        let out: Value = serde_json::from_str(&outputs[0].output).unwrap();
        assert!(out["error"]
            .as_str()
            .unwrap()
            .contains("weather request failed"));
    }

    #[test]
    fn weather_summary_reads_current_block() {
        let place = Place {
            name: "Berlin".to_string(),
            latitude: 52.5,
            longitude: 13.4,
            country: Some("Germany".to_string()),
        };
        let forecast = json!({
            "current_units": {"temperature_2m": "°C", "wind_speed_10m": "km/h"},
            "current": {"time": "2024-05-01T12:00", "temperature_2m": 18.2, "wind_speed_10m": 9.4}
        });
        let v = summarize_weather(&place, &forecast);
        assert_eq!(v["location"], "Berlin, Germany");
        assert_eq!(v["temperature"], 18.2);
        assert_eq!(v["wind_speed_unit"], "km/h");
    }
}
