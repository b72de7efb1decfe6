//! PDF to document elements.
//!
//! Page text comes from `lopdf`; when a file cannot be parsed and an OCR
//! endpoint is configured, the raw PDF is posted there instead. Page text is
//! then split into title and narrative blocks while a heading breadcrumb is
//! tracked across pages.

use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use crate::models::{DocumentElement, ElementCategory, Heading};
use crate::traits::DocumentConverter;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

const NUMBERED_HEADING: &str = r"^(\d+(?:\.\d+)*)\.?\s+\p{Lu}\S*(?:\s+\S+){0,12}$";
const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    /// `None` for a blank endpoint; blank keys are dropped.
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Option<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Some(Self {
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

pub struct LopdfConverter {
    ocr: Option<OcrEndpointConfig>,
    numbered_heading: Regex,
}

impl LopdfConverter {
    pub fn new(ocr: Option<OcrEndpointConfig>) -> Result<Self, IngestError> {
        Ok(Self {
            ocr,
            numbered_heading: Regex::new(NUMBERED_HEADING)?,
        })
    }

    pub fn extract_page_texts(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        match extract_with_lopdf(path) {
            Ok(pages) => Ok(pages),
            Err(IngestError::PdfParse(parse_error)) => match self.extract_with_ocr(path) {
                Ok(Some(pages)) => Ok(pages),
                Ok(None) => Err(IngestError::PdfParse(parse_error)),
                Err(ocr_error) => Err(IngestError::PdfParse(format!(
                    "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                ))),
            },
            Err(error) => Err(error),
        }
    }

    fn extract_with_ocr(&self, path: &Path) -> Result<Option<Vec<PageText>>, IngestError> {
        let Some(cfg) = &self.ocr else {
            return Ok(None);
        };
        tokio::task::block_in_place(|| extract_with_llm_ocr_blocking(cfg, path)).map(Some)
    }

    /// Splits pages into elements, carrying the heading breadcrumb across
    /// page boundaries.
    pub fn pages_to_elements(&self, pages: &[PageText]) -> Vec<DocumentElement> {
        let mut breadcrumb: Vec<(usize, String)> = Vec::new();
        let mut elements = Vec::new();

        for page in pages {
            for block in split_blocks(&page.text, |line| self.is_title_line(line)) {
                match block {
                    Block::Title(title) => {
                        let depth = self.heading_depth(&title);
                        breadcrumb.retain(|(level, _)| *level < depth);
                        elements.push(
                            DocumentElement::new(ElementCategory::Title, page.number, &title)
                                .with_headings(headings_of(&breadcrumb)),
                        );
                        breadcrumb.push((depth, title));
                    }
                    Block::Body(text) => elements.push(
                        DocumentElement::new(ElementCategory::NarrativeText, page.number, text)
                            .with_headings(headings_of(&breadcrumb)),
                    ),
                }
            }
        }

        elements
    }

    fn is_title_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.chars().count() > MAX_TITLE_CHARS {
            return false;
        }
        if line.ends_with(&['.', ',', ';', ':'][..]) {
            return false;
        }
        if self.numbered_heading.is_match(line) {
            return true;
        }

        let letters = line.chars().filter(|c| c.is_alphabetic()).count();
        letters >= 3
            && line.split_whitespace().count() <= 12
            && line
                .chars()
                .filter(|c| c.is_alphabetic())
                .all(char::is_uppercase)
    }

    /// `1` for unnumbered titles, otherwise the number of section components.
    fn heading_depth(&self, title: &str) -> usize {
        self.numbered_heading
            .captures(title)
            .and_then(|captures| captures.get(1))
            .map(|number| number.as_str().split('.').count())
            .unwrap_or(1)
    }
}

impl DocumentConverter for LopdfConverter {
    fn convert(&self, path: &Path) -> Result<Vec<DocumentElement>, IngestError> {
        let pages = self.extract_page_texts(path)?;
        Ok(self.pages_to_elements(&pages))
    }
}

fn headings_of(breadcrumb: &[(usize, String)]) -> Vec<Heading> {
    breadcrumb
        .iter()
        .map(|(_, title)| Heading::PlainText(title.clone()))
        .collect()
}

#[derive(Debug, PartialEq)]
enum Block {
    Title(String),
    Body(String),
}

/// Blank lines end a body block; a title line is always its own block.
fn split_blocks(text: &str, is_title: impl Fn(&str) -> bool) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush_body(&mut body, &mut blocks);
        } else if is_title(trimmed) {
            flush_body(&mut body, &mut blocks);
            blocks.push(Block::Title(normalize_whitespace(trimmed)));
        } else {
            body.push(trimmed);
        }
    }
    flush_body(&mut body, &mut blocks);

    blocks
}

fn flush_body(body: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !body.is_empty() {
        blocks.push(Block::Body(normalize_whitespace(&body.join(" "))));
        body.clear();
    }
}

fn extract_with_lopdf(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(PageText {
                number: page_no,
                text,
            });
        }
    }

    if pages.is_empty() {
        return Err(IngestError::PdfParse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(pages)
}

fn extract_with_llm_ocr_blocking(
    cfg: &OcrEndpointConfig,
    path: &Path,
) -> Result<Vec<PageText>, IngestError> {
    let pdf = std::fs::read(path)?;
    let payload = LlmOcrRequest {
        pdf_base64: STANDARD.encode(pdf),
        source_path: path.to_string_lossy().to_string(),
    };

    let mut request = Client::new()
        .post(&cfg.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &cfg.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request.send()?;

    if !response.status().is_success() {
        return Err(IngestError::OcrFailed(format!(
            "multimodal OCR request to {} returned {}",
            cfg.endpoint,
            response.status()
        )));
    }

    let payload: LlmOcrResponse = response.json()?;
    payload_to_pages(&payload, path)
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: page.page.unwrap_or(1),
                        text: text.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}
