//! Download trigger: a hidden frame whose navigation the intercept context
//! answers with the transfer's live stream.

use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;
use url::Url;

use crate::error::MetaError;
use crate::host::Document;
use crate::protocol::{FILE_GENERATION, FILE_ID, FILE_NAME, FILE_SIZE, FILE_TOTAL};

/// Everything except `A-Z a-z 0-9 - _ . ! ~` is escaped, which keeps the
/// value safe inside a `Content-Disposition` header as well as a URL.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~');

const RESOLVE_BASE: &str = "http://intercept.invalid/";

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Metadata of one logical file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: u64,
    /// Distinguishes successive starts under one id; `0` means unstamped.
    pub generation: u64,
}

impl TransferMeta {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        chunk_count: u64,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            file_size,
            chunk_count,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// `/{id}?fileId={id}&fileSize={n}&fileTotal={n}&fileName={escaped}`,
    /// plus `&fileGen={n}` once stamped.
    pub fn download_path(&self) -> String {
        let id = encode_component(&self.id);
        let mut path = format!(
            "/{id}?{FILE_ID}={id}&{FILE_SIZE}={}&{FILE_TOTAL}={}&{FILE_NAME}={}",
            self.file_size,
            self.chunk_count,
            encode_component(&self.file_name),
        );
        if self.generation != 0 {
            path.push_str(&format!("&{FILE_GENERATION}={}", self.generation));
        }
        path
    }

    /// Recovers the metadata from a trigger URL (absolute or path-only).
    pub fn from_download_url(raw: &str) -> Result<Self, MetaError> {
        let base = Url::parse(RESOLVE_BASE).map_err(|err| MetaError::Url(err.to_string()))?;
        let url = base
            .join(raw)
            .map_err(|err| MetaError::Url(format!("{raw}: {err}")))?;

        let mut id = None;
        let mut file_size = None;
        let mut chunk_count = None;
        let mut file_name = None;
        let mut generation = 0;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                FILE_ID => id = Some(value.into_owned()),
                FILE_SIZE => file_size = Some(parse_count(FILE_SIZE, &value)?),
                FILE_TOTAL => chunk_count = Some(parse_count(FILE_TOTAL, &value)?),
                FILE_NAME => file_name = Some(value.into_owned()),
                FILE_GENERATION => generation = parse_count(FILE_GENERATION, &value)?,
                _ => {}
            }
        }

        let id = id.ok_or(MetaError::Missing(FILE_ID))?;
        let segment = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned());
        if segment.as_deref() != Some(id.as_str()) {
            return Err(MetaError::Invalid {
                field: FILE_ID,
                value: id,
            });
        }

        Ok(Self {
            id,
            file_name: file_name.ok_or(MetaError::Missing(FILE_NAME))?,
            file_size: file_size.ok_or(MetaError::Missing(FILE_SIZE))?,
            chunk_count: chunk_count.ok_or(MetaError::Missing(FILE_TOTAL))?,
            generation,
        })
    }
}

fn parse_count(field: &'static str, value: &str) -> Result<u64, MetaError> {
    value.parse().map_err(|_| MetaError::Invalid {
        field,
        value: value.to_string(),
    })
}

/// A hidden navigational element attached to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenFrame {
    pub id: String,
    pub src: String,
    pub hidden: bool,
}

pub struct DownloadTrigger {
    document: Arc<dyn Document>,
}

impl DownloadTrigger {
    pub fn new(document: Arc<dyn Document>) -> Self {
        Self { document }
    }

    pub fn fire(&self, meta: &TransferMeta) {
        let frame = HiddenFrame {
            id: meta.id.clone(),
            src: meta.download_path(),
            hidden: true,
        };
        debug!(id = %meta.id, src = %frame.src, "attaching download trigger");
        self.document.append_frame(frame);
    }

    /// Detaches the frame for `id`; `false` when none was attached.
    pub fn dispose(&self, id: &str) -> bool {
        self.document.remove_frame(id)
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.document.contains_frame(id)
    }
}
