use crate::error::IngestError;
use crate::models::{Chunk, DocumentElement, Heading, IngestionOptions, DEFAULT_PAGE_NUMBER};
use crate::normalize::TextNormalizer;

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits `text` into windows of at most `chunk_size` chars, each starting
/// `chunk_overlap` chars before the previous one ended. Window ends prefer the
/// last whitespace in the back half of the window.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= chunk_size {
        return vec![chars.iter().collect()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            if let Some(offset) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if offset > chunk_size / 2 {
                    end = start + offset;
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        if end == chars.len() {
            break;
        }

        let mut next = end.saturating_sub(chunk_overlap);
        if let Some(offset) = chars[next..end].iter().position(|c| c.is_whitespace()) {
            next += offset + 1;
        }
        start = if next > start { next } else { end };
    }

    pieces
}

/// A run of element text that is chunked as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedUnit {
    pub text: String,
    pub page: u32,
    pub headings: Vec<String>,
}

impl MergedUnit {
    fn from_element(element: &DocumentElement) -> Self {
        Self {
            text: element.text.trim().to_string(),
            page: element.page.unwrap_or(DEFAULT_PAGE_NUMBER),
            headings: resolve_headings(&element.headings),
        }
    }

    fn from_title(title: &DocumentElement) -> Self {
        let mut unit = Self::from_element(title);
        unit.headings = title_breadcrumb(title);
        unit
    }

    fn fuse(title: &DocumentElement, body: &DocumentElement) -> Self {
        Self {
            text: format!("{}\n{}", title.text.trim(), body.text.trim()),
            page: title.page.or(body.page).unwrap_or(DEFAULT_PAGE_NUMBER),
            headings: title_breadcrumb(title),
        }
    }
}

fn resolve_headings(headings: &[Heading]) -> Vec<String> {
    headings
        .iter()
        .map(|heading| heading.as_text().trim())
        .filter(|heading| !heading.is_empty())
        .map(str::to_string)
        .collect()
}

fn title_breadcrumb(title: &DocumentElement) -> Vec<String> {
    let mut headings = resolve_headings(&title.headings);
    let own = title.text.trim();
    if !own.is_empty() && headings.last().map(String::as_str) != Some(own) {
        headings.push(own.to_string());
    }
    headings
}

enum ScanState {
    Normal,
    PendingTitle(DocumentElement),
}

/// Fuses every title with the element right after it. A title consumes
/// exactly one following element (even another title), or none if it is last.
pub fn merge_titles(elements: impl IntoIterator<Item = DocumentElement>) -> Vec<MergedUnit> {
    let mut units = Vec::new();
    let mut state = ScanState::Normal;

    for element in elements {
        state = match state {
            ScanState::Normal if element.is_title() => ScanState::PendingTitle(element),
            ScanState::Normal => {
                units.push(MergedUnit::from_element(&element));
                ScanState::Normal
            }
            ScanState::PendingTitle(title) => {
                units.push(MergedUnit::fuse(&title, &element));
                ScanState::Normal
            }
        };
    }

    if let ScanState::PendingTitle(title) = state {
        units.push(MergedUnit::from_title(&title));
    }

    units
}

#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    options: IngestionOptions,
    normalizer: TextNormalizer,
}

impl ChunkBuilder {
    pub fn new(options: IngestionOptions, normalizer: TextNormalizer) -> Result<Self, IngestError> {
        options.validate()?;
        Ok(Self {
            options,
            normalizer,
        })
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    /// Chunks for one source, numbered `0..N` after degenerate chunks are
    /// dropped.
    pub fn build(&self, source: &str, filename: &str, elements: Vec<DocumentElement>) -> Vec<Chunk> {
        let allowed = elements.into_iter().filter(|element| {
            self.options.allowed_categories.contains(&element.category)
                && !element.text.trim().is_empty()
        });

        let units = if self.options.merge_titles {
            merge_titles(allowed)
        } else {
            allowed.map(|element| MergedUnit::from_element(&element)).collect()
        };

        units
            .iter()
            .flat_map(|unit| {
                split_text(&unit.text, self.options.chunk_size, self.options.chunk_overlap)
                    .into_iter()
                    .map(move |piece| (unit, piece))
            })
            .map(|(unit, piece)| (unit, self.normalizer.normalize(&piece).trim().to_string()))
            .filter(|(_, text)| text.chars().count() > self.options.min_chunk_chars)
            .enumerate()
            .map(|(index, (unit, text))| Chunk {
                text,
                source: source.to_string(),
                filename: filename.to_string(),
                page_number: unit.page,
                headings: unit.headings.clone(),
                chunk_index: index as u64,
            })
            .collect()
    }
}
