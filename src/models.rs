// Lists the models installed on the backend

use crate::error::{RelayError, Result};
use crate::ollama_api::{OllamaClient, TagEntry};

use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub id: String,
    pub size: String,
    pub modified: String,
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_model_names(&self) -> Result<Vec<String>>;

    async fn list_models_detailed(&self) -> Result<Vec<ModelInfo>>;
}

/// Catalog backed by the `ollama list` command.
pub struct OllamaCli {
    program: String,
}

impl OllamaCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run_list(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("list")
            .output()
            .await
            .map_err(|e| {
                tracing::error!("Error executing {} list: {}", self.program, e);
                RelayError::ModelListing(e.to_string())
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::warn!("Warning from ollama command: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(RelayError::ModelListing(format!(
                "{} list exited with {}",
                self.program, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ModelCatalog for OllamaCli {
    async fn list_model_names(&self) -> Result<Vec<String>> {
        Ok(parse_model_names(&self.run_list().await?))
    }

    async fn list_models_detailed(&self) -> Result<Vec<ModelInfo>> {
        Ok(parse_model_table(&self.run_list().await?))
    }
}

// First column of every row after the header
pub fn parse_model_names(stdout: &str) -> Vec<String> {
    stdout
        .trim()
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub fn parse_model_table(stdout: &str) -> Vec<ModelInfo> {
    static PADDING: OnceLock<Regex> = OnceLock::new();
    let padding = PADDING.get_or_init(|| Regex::new(r"\t+|\s{2,}").expect("valid column regex"));

    stdout
        .trim()
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let padded: Vec<&str> = padding.split(line).collect();
            if padded.len() >= 4 {
                return Some(ModelInfo {
                    name: padded[0].to_string(),
                    id: padded[1].to_string(),
                    size: padded[2].to_string(),
                    modified: padded[3..].join(" "),
                });
            }

            // Single-space separated output: the remaining columns are the date
            let columns: Vec<&str> = line.split_whitespace().collect();
            (columns.len() >= 4).then(|| ModelInfo {
                name: columns[0].to_string(),
                id: columns[1].to_string(),
                size: columns[2].to_string(),
                modified: columns[3..].join(" "),
            })
        })
        .collect()
}

/// Catalog backed by the backend's `/api/tags` endpoint.
pub struct OllamaTags {
    client: OllamaClient,
}

impl OllamaTags {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }

    async fn tags(&self) -> Result<Vec<TagEntry>> {
        match self.client.fetch_tags().await {
            Ok(tags) => Ok(tags.models),
            Err(e) => {
                tracing::error!("Error querying {}/api/tags: {}", self.client.base_url(), e);
                match e {
                    RelayError::ModelListing(_) => Err(e),
                    other => Err(RelayError::ModelListing(other.to_string())),
                }
            }
        }
    }
}

#[async_trait]
impl ModelCatalog for OllamaTags {
    async fn list_model_names(&self) -> Result<Vec<String>> {
        Ok(self.tags().await?.into_iter().map(|m| m.name).collect())
    }

    async fn list_models_detailed(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.tags().await?.into_iter().map(ModelInfo::from).collect())
    }
}

impl From<TagEntry> for ModelInfo {
    fn from(entry: TagEntry) -> Self {
        let digest = entry.digest.strip_prefix("sha256:").unwrap_or(&entry.digest);
        let modified = DateTime::parse_from_rfc3339(&entry.modified_at)
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|_| entry.modified_at.clone());

        Self {
            id: digest.chars().take(12).collect(),
            size: human_size(entry.size),
            modified,
            name: entry.name,
        }
    }
}

// Decimal units, the way `ollama list` prints them
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for candidate in UNITS {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = candidate;
    }
    if value < 10.0 {
        format!("{value:.1} {unit}")
    } else {
        format!("{value:.0} {unit}")
    }
}
