//! PNCP (Portal Nacional de Contratações Públicas) client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::PipelineError;
use crate::domain::Procurement;

use super::{Download, Registry};

/// Registry endpoints and search scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Public query API (procurement search)
    #[serde(default = "default_query_api_url")]
    pub query_api_url: String,

    /// Integration API (documents of a procurement)
    #[serde(default = "default_integration_api_url")]
    pub integration_api_url: String,

    /// IBGE municipality codes to restrict the search to; empty searches nationwide
    #[serde(default)]
    pub target_ibge_codes: Vec<String>,

    /// Procurement modality codes searched for updates
    #[serde(default = "default_modalities")]
    pub modalities: Vec<u32>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_query_api_url() -> String {
    "https://pncp.gov.br/api/consulta/v1/".to_string()
}
fn default_integration_api_url() -> String {
    "https://pncp.gov.br/api/pncp/v1/".to_string()
}
/// Electronic reverse auction, waiver, unenforceability, electronic competition
fn default_modalities() -> Vec<u32> {
    vec![6, 8, 9, 4]
}
fn default_request_timeout() -> u64 {
    30
}
fn default_download_timeout() -> u64 {
    90
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            query_api_url: default_query_api_url(),
            integration_api_url: default_integration_api_url(),
            target_ibge_codes: Vec::new(),
            modalities: default_modalities(),
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdatePage {
    #[serde(default)]
    data: Vec<Value>,

    #[serde(rename = "totalPaginas", default)]
    total_pages: u32,
}

pub struct PncpRegistry {
    config: RegistryConfig,
    client: reqwest::Client,
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// File name from a `Content-Disposition` header value
fn disposition_file_name(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("filename=")? + "filename=".len();
    let rest = header[start..].trim_start();
    let name = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split(';').next()?.trim(),
    };
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Last path segment of a URL, without query string
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("document")
        .to_string()
}

impl PncpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    /// All pages of one (modality, municipality) search
    async fn fetch_updates(&self, date: NaiveDate, modality: u32, ibge_code: Option<&str>) -> Result<Vec<Value>> {
        let url = join_url(&self.config.query_api_url, "contratacoes/atualizacao");
        let day = date.format("%Y%m%d").to_string();
        let mut collected = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut query = vec![
                ("dataInicial", day.clone()),
                ("dataFinal", day.clone()),
                ("codigoModalidadeContratacao", modality.to_string()),
                ("pagina", page.to_string()),
            ];
            if let Some(code) = ibge_code {
                query.push(("codigoMunicipioIbge", code.to_string()));
            }

            let response = self
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(PipelineError::transient)
                .with_context(|| format!("Failed to fetch updates page {}", page))?;

            if response.status() == StatusCode::NO_CONTENT {
                break;
            }
            if !response.status().is_success() {
                return Err(PipelineError::Transient(format!("{} returned {}", url, response.status())).into());
            }

            let parsed: UpdatePage = response
                .json()
                .await
                .map_err(|e| PipelineError::Validation(format!("updates page {}: {}", page, e)))?;
            if parsed.data.is_empty() {
                break;
            }
            collected.extend(parsed.data);
            if page >= parsed.total_pages {
                break;
            }
            page += 1;
        }
        Ok(collected)
    }
}

#[async_trait]
impl Registry for PncpRegistry {
    async fn list_updated(&self, date: NaiveDate) -> Result<Vec<Value>> {
        let codes: Vec<Option<&str>> = if self.config.target_ibge_codes.is_empty() {
            warn!("No target IBGE codes configured, searching nationwide");
            vec![None]
        } else {
            self.config.target_ibge_codes.iter().map(|c| Some(c.as_str())).collect()
        };

        let mut all = Vec::new();
        for code in codes {
            for &modality in &self.config.modalities {
                match self.fetch_updates(date, modality, code).await {
                    Ok(found) => {
                        debug!(modality, ibge_code = ?code, found = found.len(), "Fetched updates");
                        all.extend(found);
                    }
                    Err(e) => {
                        error!(modality, ibge_code = ?code, error = %format!("{:#}", e), "Failed to fetch updates");
                    }
                }
            }
        }
        info!(%date, total = all.len(), "Finished fetching updated procurements");
        Ok(all)
    }

    async fn list_documents(&self, procurement: &Procurement) -> Result<Vec<Value>> {
        let url = join_url(
            &self.config.integration_api_url,
            &format!(
                "orgaos/{}/compras/{}/{}/arquivos",
                procurement.cnpj, procurement.year, procurement.sequence
            ),
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to list documents of {}", procurement.control_number))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(PipelineError::Transient(format!("{} returned {}", url, response.status())).into());
        }
        let docs: Vec<Value> = response
            .json()
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Invalid document list for {}", procurement.control_number))?;
        Ok(docs)
    }

    async fn download(&self, url: &str) -> Result<Download> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.download_timeout_secs))
            .send()
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to download {}", url))?;

        if !response.status().is_success() {
            bail!("Download of {} returned {}", url, response.status());
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| url_file_name(url));

        let content = response
            .bytes()
            .await
            .map_err(PipelineError::transient)
            .with_context(|| format!("Failed to read body of {}", url))?;
        if content.is_empty() {
            bail!("Download of {} returned an empty body", url);
        }

        Ok(Download {
            file_name,
            content: content.to_vec(),
        })
    }
}
