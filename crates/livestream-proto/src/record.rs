use reqwest::Url;
use serde::{Deserialize, Serialize};

/// One radio-station definition as stored in `live_streams.sii`.
///
/// `bitrate` is kept as text: the list format is untyped and a record must
/// survive a load/save cycle byte-for-byte even before it has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub language: String,
    pub bitrate: String,
    #[serde(default = "default_extra")]
    pub extra: String,
}

pub fn default_extra() -> String {
    "0".to_string()
}

/// First rule a record breaks, in checking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Stream URL is required.")]
    MissingUrl,
    #[error("Stream URL is not valid.")]
    InvalidUrl,
    #[error("Stream name is required.")]
    MissingName,
    #[error("Bitrate is required.")]
    MissingBitrate,
    #[error("Bitrate must be a number.")]
    InvalidBitrate,
}

impl StreamRecord {
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        genre: impl Into<String>,
        language: impl Into<String>,
        bitrate: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            genre: genre.into(),
            language: language.into(),
            bitrate: bitrate.into(),
            extra: default_extra(),
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    /// Value of the column a list view sorts by.
    pub fn column(&self, column: SortColumn) -> &str {
        match column {
            SortColumn::Url => &self.url,
            SortColumn::Name => &self.name,
            SortColumn::Genre => &self.genre,
            SortColumn::Language => &self.language,
            SortColumn::Bitrate => &self.bitrate,
            SortColumn::Extra => &self.extra,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortColumn {
    Url,
    Name,
    Genre,
    Language,
    Bitrate,
    Extra,
}

/// `http`/`https` with a non-empty host.
pub fn is_valid_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

pub fn validate(record: &StreamRecord) -> Result<(), ValidationError> {
    let url = record.url.trim();
    if url.is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    if !is_valid_url(url) {
        return Err(ValidationError::InvalidUrl);
    }
    if record.name.trim().is_empty() {
        return Err(ValidationError::MissingName);
    }
    let bitrate = record.bitrate.trim();
    if bitrate.is_empty() {
        return Err(ValidationError::MissingBitrate);
    }
    if bitrate.parse::<i64>().is_err() {
        return Err(ValidationError::InvalidBitrate);
    }
    Ok(())
}

/// Pre-save gate: the index of the first invalid record and why.
pub fn validate_all(records: &[StreamRecord]) -> Result<(), (usize, ValidationError)> {
    records
        .iter()
        .enumerate()
        .try_for_each(|(i, r)| validate(r).map_err(|e| (i, e)))
}
