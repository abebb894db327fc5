//! HTTP client for the analysis server, shared by the scanner driver's
//! ingestion wait and the metrics exporter.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum SonarError {
    #[error("analysis server error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("analysis server transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid analysis server url: {0}")]
    Url(String),
}

impl SonarError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SonarError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Credential for the analysis server: bearer token, or HTTP Basic built
/// from `user:pass` / `token:`.
#[derive(Debug, Clone)]
pub enum SonarAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

impl SonarAuth {
    pub fn token(token: impl Into<String>) -> Self {
        SonarAuth::Bearer(token.into())
    }

    /// Parse the `user:pass` / `token:` spelling. `None` when no colon is
    /// present.
    pub fn parse_basic(raw: &str) -> Option<Self> {
        let (username, password) = raw.split_once(':')?;
        Some(SonarAuth::Basic { username: username.to_string(), password: password.to_string() })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentKey {
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsPage {
    #[serde(default)]
    pub components: Vec<ComponentKey>,
    #[serde(default)]
    pub paging: Paging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsPage {
    #[serde(default)]
    pub metrics: Vec<ComponentKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periods: Vec<Period>,
}

impl Measure {
    /// The scalar value, falling back to the first period when the server
    /// only reports period-scoped values.
    pub fn scalar(&self) -> Option<&Value> {
        self.value
            .as_ref()
            .or_else(|| self.periods.first().and_then(|p| p.value.as_ref()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeasuredComponent {
    #[serde(default)]
    pub measures: Vec<Measure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeasuresResponse {
    #[serde(default)]
    pub component: Option<MeasuredComponent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CeTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CeActivity {
    #[serde(default)]
    pub current: Option<CeTask>,
    #[serde(default)]
    pub queue: Vec<CeTask>,
}

pub struct SonarClient {
    http: reqwest::Client,
    base: Url,
    auth: SonarAuth,
}

impl SonarClient {
    pub fn new(base_url: &str, auth: SonarAuth) -> Result<Self, SonarError> {
        let mut raw = base_url.trim_end_matches('/').to_string();
        raw.push('/');
        let base = Url::parse(&raw).map_err(|e| SonarError::Url(e.to_string()))?;
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self { http, base, auth })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SonarError> {
        let url = self.base.join(path).map_err(|e| SonarError::Url(e.to_string()))?;
        let mut req = self.http.get(url).query(params);
        req = match &self.auth {
            SonarAuth::Bearer(token) => req.bearer_auth(token),
            SonarAuth::Basic { username, password } => {
                req.basic_auth(username, Some(password))
            }
        };
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SonarError::Api { status: status.as_u16(), body });
        }
        Ok(res.json().await?)
    }

    /// GET with exponential backoff over 429/5xx and transport failures.
    pub async fn get_json_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
        retries: u32,
        backoff: f64,
    ) -> Result<T, SonarError> {
        let mut attempt = 0u32;
        loop {
            match self.get_json::<T>(path, params).await {
                Ok(v) => return Ok(v),
                Err(err) if attempt < retries && is_transient(&err) => {
                    let delay = backoff * f64::from(2u32.saturating_pow(attempt));
                    warn!("transient analysis-server failure ({err}), retrying in {delay:.1}s");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// All project keys, paginated.
    pub async fn search_projects(&self, qualifier: &str) -> Result<Vec<String>, SonarError> {
        let mut keys = Vec::new();
        let mut page = 1usize;
        loop {
            let page_str = page.to_string();
            let ps = PAGE_SIZE.to_string();
            let data: ProjectsPage = self
                .get_json(
                    "api/projects/search",
                    &[("p", page_str.as_str()), ("ps", ps.as_str()), ("qualifiers", qualifier)],
                )
                .await?;
            if data.components.is_empty() {
                break;
            }
            let got = data.components.len();
            keys.extend(data.components.into_iter().map(|c| c.key));
            if keys.len() as u64 >= data.paging.total || got < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(keys)
    }

    /// All metric keys known to the server, paginated.
    pub async fn search_metrics(&self) -> Result<Vec<String>, SonarError> {
        let mut keys = Vec::new();
        let mut page = 1usize;
        loop {
            let page_str = page.to_string();
            let ps = PAGE_SIZE.to_string();
            let data: MetricsPage = self
                .get_json("api/metrics/search", &[("p", page_str.as_str()), ("ps", ps.as_str())])
                .await?;
            if data.metrics.is_empty() {
                break;
            }
            let got = data.metrics.len();
            keys.extend(data.metrics.into_iter().map(|m| m.key));
            if got < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(keys)
    }

    /// Measures for one chunk of metric keys.
    pub async fn component_measures(
        &self,
        component: &str,
        metric_keys: &[String],
        retries: u32,
        backoff: f64,
    ) -> Result<Vec<Measure>, SonarError> {
        let joined = metric_keys.join(",");
        let data: MeasuresResponse = self
            .get_json_retry(
                "api/measures/component",
                &[("component", component), ("metricKeys", joined.as_str())],
                retries,
                backoff,
            )
            .await?;
        Ok(data.component.map(|c| c.measures).unwrap_or_default())
    }

    /// Current compute-engine task and queue for a component.
    pub async fn ce_activity(&self, component: &str) -> Result<CeActivity, SonarError> {
        self.get_json("api/ce/component", &[("component", component)]).await
    }
}

fn is_transient(err: &SonarError) -> bool {
    match err {
        SonarError::Api { status, .. } => *status == 429 || *status >= 500,
        SonarError::Http(_) => true,
        SonarError::Url(_) => false,
    }
}

/// Render a JSON measure value the way it lands in the CSV: strings
/// verbatim, anything else via its JSON form.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
