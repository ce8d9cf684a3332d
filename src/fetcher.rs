use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

use flate2::read::GzDecoder;
use miette::Diagnostic;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

use crate::accession::AccessionKind;

/// Raw upstream metadata for one accession, keyed by the owning kind's column
/// names. Normalization into typed records happens in the resolver.
pub type RawFields = BTreeMap<String, String>;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("accession not found upstream: {0}")]
    NotFound(String),

    #[error("metadata request failed: {0}")]
    Network(String),

    #[error("metadata service rate limited the request")]
    RateLimited,
}

pub trait MetadataFetcher: Send + Sync {
    fn fetch(&self, kind: AccessionKind, id: &str) -> Result<RawFields, FetchError>;
}

#[derive(Clone)]
pub struct GeoSoftFetcher {
    client: Client,
    geo_ftp_base: String,
    geo_query_base: String,
    eutils_base: String,
}

impl GeoSoftFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqstage/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FetchError::Network(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self {
            client,
            geo_ftp_base: "https://ftp.ncbi.nlm.nih.gov".to_string(),
            geo_query_base: "https://www.ncbi.nlm.nih.gov".to_string(),
            eutils_base: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
        })
    }

    fn get_text(&self, url: &str, id: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let response = check_status(response, id)?;
        response
            .text()
            .map_err(|err| FetchError::Network(err.to_string()))
    }

    fn get_gzip_text(&self, url: &str, id: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let response = check_status(response, id)?;
        let bytes = response
            .bytes()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let mut decoder = GzDecoder::new(bytes.as_ref());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(text)
    }

    fn fetch_study(&self, id: &str) -> Result<RawFields, FetchError> {
        let url = format!(
            "{}/geo/series/{}/{id}/soft/{id}_family.soft.gz",
            self.geo_ftp_base,
            series_prefix(id)
        );
        let text = self.get_gzip_text(&url, id)?;
        Ok(parse_series_soft(&text))
    }

    fn fetch_sample(&self, id: &str) -> Result<RawFields, FetchError> {
        let url = format!(
            "{}/geo/query/acc.cgi?acc={id}&targ=self&form=text&view=full",
            self.geo_query_base
        );
        let text = self.get_text(&url, id)?;
        Ok(parse_sample_soft(&text))
    }

    fn fetch_run(&self, id: &str) -> Result<RawFields, FetchError> {
        let url = format!(
            "{}/efetch.fcgi?db=sra&rettype=runinfo&retmode=text&id={id}",
            self.eutils_base
        );
        let text = self.get_text(&url, id)?;
        parse_runinfo_csv(&text, id)
    }
}

impl MetadataFetcher for GeoSoftFetcher {
    fn fetch(&self, kind: AccessionKind, id: &str) -> Result<RawFields, FetchError> {
        match kind {
            AccessionKind::Study => self.fetch_study(id),
            AccessionKind::Sample => self.fetch_sample(id),
            AccessionKind::Run => self.fetch_run(id),
        }
    }
}

fn check_status(
    response: reqwest::blocking::Response,
    id: &str,
) -> Result<reqwest::blocking::Response, FetchError> {
    match response.status().as_u16() {
        404 => Err(FetchError::NotFound(id.to_string())),
        429 => Err(FetchError::RateLimited),
        status if !response.status().is_success() => {
            Err(FetchError::Network(format!("status {status}")))
        }
        _ => Ok(response),
    }
}

/// GEO shards series directories by accession: GSE102902 lives under
/// GSE102nnn.
pub fn series_prefix(accession: &str) -> String {
    let digits = accession.trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{}nnn", head)
}

fn soft_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    if !line.starts_with(key) {
        return None;
    }
    line.split_once('=').map(|(_, value)| value.trim())
}

fn run_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bSRR\d+\b").unwrap())
}

pub fn parse_series_soft(text: &str) -> RawFields {
    let mut fields = RawFields::new();
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut sample_ids: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(value) = soft_value(line, "!Series_title") {
            fields.entry("title".to_string()).or_insert_with(|| value.to_string());
        } else if let Some(value) = soft_value(line, "!Series_summary") {
            summary_lines.push(value);
        } else if let Some(value) = soft_value(line, "!Series_sample_id") {
            if !value.is_empty() && !sample_ids.iter().any(|seen| seen == value) {
                sample_ids.push(value.to_string());
            }
        }
    }
    fields.insert("summary".to_string(), summary_lines.join(" "));
    fields.insert("child_sample_ids".to_string(), sample_ids.join(","));
    fields
}

pub fn parse_sample_soft(text: &str) -> RawFields {
    let mut fields = RawFields::new();
    let mut run_ids: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(value) = soft_value(line, "!Sample_title") {
            fields.entry("title".to_string()).or_insert_with(|| value.to_string());
        } else if let Some(value) = soft_value(line, "!Sample_organism_ch1") {
            fields.entry("species".to_string()).or_insert_with(|| value.to_string());
        } else if let Some(value) = soft_value(line, "!Sample_supplementary_file") {
            fields.entry("raw_link".to_string()).or_insert_with(|| value.to_string());
        } else if let Some(value) = soft_value(line, "!Sample_series_id") {
            fields.entry("parent_study_id".to_string()).or_insert_with(|| value.to_string());
        }
        for found in run_id_regex().find_iter(line) {
            let found = found.as_str().to_string();
            if !run_ids.contains(&found) {
                run_ids.push(found);
            }
        }
    }
    fields.insert("child_run_ids".to_string(), run_ids.join(","));
    fields
}

pub fn parse_runinfo_csv(text: &str, id: &str) -> Result<RawFields, FetchError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines.next().unwrap_or("").split(',').collect();
    let col = |name: &str| header.iter().position(|column| *column == name);
    let (Some(run_col), Some(path_col), Some(layout_col)) = (
        col("Run"),
        col("download_path"),
        col("LibraryLayout"),
    ) else {
        return Err(FetchError::Network("malformed runinfo header".to_string()));
    };
    let sample_col = col("SampleName");

    for line in lines {
        let cells: Vec<&str> = line.split(',').collect();
        if cells.get(run_col).copied() != Some(id) {
            continue;
        }
        let mut fields = RawFields::new();
        let location = cells.get(path_col).copied().unwrap_or("");
        fields.insert("location".to_string(), location.to_string());
        let file_type = if location.ends_with(".bam") {
            "bam"
        } else {
            "fastq"
        };
        fields.insert("file_type".to_string(), file_type.to_string());
        let segments = match cells.get(layout_col).copied() {
            Some("PAIRED") => "L001:R1,L001:R2",
            _ => "L001:R1",
        };
        fields.insert("segments".to_string(), segments.to_string());
        if let Some(sample_col) = sample_col {
            if let Some(sample) = cells.get(sample_col) {
                fields.insert("parent_sample_id".to_string(), sample.to_string());
            }
        }
        return Ok(fields);
    }
    Err(FetchError::NotFound(id.to_string()))
}
