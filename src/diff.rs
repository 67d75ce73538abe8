// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming decoder for changeset diff and dump payloads.
//!
//! Turns a compressed byte stream into a lazy, forward-only sequence of
//! [`ChangesetEvent`] values. The same decoder serves both the bulk
//! archive (hundreds of GB, read through a bounded buffer) and the
//! minutely replication diffs (a few KB, decompressed in memory).
//!
//! # Malformed Input
//!
//! A single bad element is skipped and logged, never aborting the
//! stream - upstream dumps have historically contained elements with
//! broken ids, impossible date pairs, or truncated attributes, and one
//! of them must not kill a multi-day bootstrap. Only stream-level
//! problems (I/O errors, truncated containers, an element exceeding the
//! size cap) surface as errors.
//!
//! # Compression
//!
//! Payloads are sniffed by magic bytes: gzip (`1f 8b`), zstd
//! (`28 b5 2f fd`), anything else passes through as plain bytes. See
//! [`decompress_payload`] for in-memory payloads and [`sniff_reader`]
//! for streaming input.
//!
//! # Geometry Normalization
//!
//! A degenerate (zero-area) bounding box becomes a point, never a
//! zero-area polygon: downstream geometry consumers reject degenerate
//! polygons. Coordinates closer than 1e-7 degrees count as equal.

use std::collections::BTreeMap;
use std::io::{BufRead, Read};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::metrics;

/// Coordinates closer than this count as equal when deciding whether a
/// bounding box has collapsed.
pub const COORD_EPSILON: f64 = 1e-7;

/// gzip magic bytes.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// zstd frame magic bytes.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Hard cap on a single markup construct (tag, text run, comment).
///
/// Keeps peak memory bounded no matter what the input does; a real
/// changeset element is a few KB.
const MAX_TOKEN_BYTES: usize = 16 * 1024 * 1024;

/// Read chunk size for the tokenizer.
const READ_CHUNK: usize = 8 * 1024;

// =============================================================================
// Data model
// =============================================================================

/// One discussion comment on a changeset, in upstream order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub uid: Option<i64>,
    pub username: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

/// Bounding geometry of a changeset.
///
/// Built through [`Geometry::from_bounds`], which applies the
/// degenerate-box normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point {
        lon: f64,
        lat: f64,
    },
    Box {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
}

impl Geometry {
    /// Build a geometry from raw bounds, collapsing zero-area boxes to a
    /// point at the box midpoint.
    pub fn from_bounds(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        let degenerate_lon = (min_lon - max_lon).abs() < COORD_EPSILON;
        let degenerate_lat = (min_lat - max_lat).abs() < COORD_EPSILON;
        if degenerate_lon || degenerate_lat {
            Geometry::Point {
                lon: (min_lon + max_lon) / 2.0,
                lat: (min_lat + max_lat) / 2.0,
            }
        } else {
            Geometry::Box {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            }
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Geometry::Point { .. })
    }

    /// Longitudinal extent in degrees (0 for points).
    pub fn width(&self) -> f64 {
        match self {
            Geometry::Point { .. } => 0.0,
            Geometry::Box {
                min_lon, max_lon, ..
            } => (max_lon - min_lon).abs(),
        }
    }

    /// Latitudinal extent in degrees (0 for points).
    pub fn height(&self) -> f64 {
        match self {
            Geometry::Point { .. } => 0.0,
            Geometry::Box {
                min_lat, max_lat, ..
            } => (max_lat - min_lat).abs(),
        }
    }

    /// True when either axis spans more than `max_degrees`.
    pub fn exceeds_extent(&self, max_degrees: f64) -> bool {
        self.width() > max_degrees || self.height() > max_degrees
    }

    /// WKT rendering, as stored in the geometry column.
    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point { lon, lat } => format!("POINT({lon} {lat})"),
            Geometry::Box {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            } => format!(
                "POLYGON(({min_lon} {min_lat}, {max_lon} {min_lat}, {max_lon} {max_lat}, {min_lon} {max_lat}, {min_lon} {min_lat}))"
            ),
        }
    }
}

/// One observation of a changeset.
///
/// The same id recurs across diffs as the changeset is edited, commented
/// and closed; the store merges observations with later-wins semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetEvent {
    pub id: i64,
    pub username: Option<String>,
    pub uid: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub open: bool,
    pub num_changes: u32,
    pub comments_count: u32,
    pub tags: BTreeMap<String, String>,
    pub comments: Vec<Comment>,
    pub geometry: Option<Geometry>,
}

// =============================================================================
// Decompression
// =============================================================================

/// Decompress an in-memory payload, sniffing the format by magic bytes.
///
/// Unknown formats pass through untouched, so plain test fixtures and
/// pre-decompressed payloads both work.
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= GZIP_MAGIC.len() && data[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| IngestError::Decompress(format!("gzip: {e}")))?;
        Ok(out)
    } else if data.len() >= ZSTD_MAGIC.len() && data[..ZSTD_MAGIC.len()] == ZSTD_MAGIC {
        zstd::decode_all(data).map_err(|e| IngestError::Decompress(format!("zstd: {e}")))
    } else {
        Ok(data.to_vec())
    }
}

/// Wrap a buffered reader in the right streaming decompressor, sniffing
/// the format from the first bytes without consuming them.
pub fn sniff_reader<R>(mut reader: R) -> Result<Box<dyn Read + Send>>
where
    R: BufRead + Send + 'static,
{
    let head = reader
        .fill_buf()
        .map_err(|e| IngestError::Decompress(format!("cannot read stream head: {e}")))?;

    if head.len() >= GZIP_MAGIC.len() && head[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        Ok(Box::new(flate2::bufread::GzDecoder::new(reader)))
    } else if head.len() >= ZSTD_MAGIC.len() && head[..ZSTD_MAGIC.len()] == ZSTD_MAGIC {
        let decoder = zstd::stream::read::Decoder::with_buffer(reader)
            .map_err(|e| IngestError::Decompress(format!("zstd init: {e}")))?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(reader))
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug)]
enum Token {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
    Text(String),
    Eof,
}

/// Incremental markup tokenizer over a byte stream.
///
/// Holds at most one construct (plus read slack) in memory, capped at
/// [`MAX_TOKEN_BYTES`]. Lenient where the upstream feed is sloppy:
/// attribute values are decoded lossily from UTF-8 and unknown entities
/// pass through verbatim.
struct Tokenizer<R: Read> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> Tokenizer<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
        }
    }

    /// Drop consumed bytes. Only safe between tokens; scans hold
    /// absolute indices into `buf`.
    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Pull one chunk from the reader. Returns false at EOF.
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.buf.len() >= MAX_TOKEN_BYTES {
            return Err(IngestError::DiffParse(format!(
                "markup construct exceeds {MAX_TOKEN_BYTES} bytes"
            )));
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(IngestError::DiffParse(format!("stream read failed: {e}")))
                }
            }
        }
    }

    /// Absolute index of the next `byte` at or after `from`, filling as
    /// needed. None when the stream ends first.
    fn scan_for(&mut self, byte: u8, from: usize) -> Result<Option<usize>> {
        let mut start = from;
        loop {
            if let Some(offset) = self.buf[start..].iter().position(|&b| b == byte) {
                return Ok(Some(start + offset));
            }
            start = self.buf.len();
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Absolute index just past `needle`, searching from `from`.
    fn scan_past(&mut self, needle: &[u8], from: usize) -> Result<Option<usize>> {
        loop {
            if self.buf.len() >= from + needle.len() {
                if let Some(offset) = self.buf[from..]
                    .windows(needle.len())
                    .position(|w| w == needle)
                {
                    return Ok(Some(from + offset + needle.len()));
                }
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// End index of a start tag: the first `>` outside quotes.
    fn scan_tag_end(&mut self, from: usize) -> Result<usize> {
        let mut i = from;
        let mut quote: Option<u8> = None;
        loop {
            while i < self.buf.len() {
                let b = self.buf[i];
                match quote {
                    Some(q) => {
                        if b == q {
                            quote = None;
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => quote = Some(b),
                        b'>' => return Ok(i),
                        _ => {}
                    },
                }
                i += 1;
            }
            if !self.fill()? {
                return Err(IngestError::DiffParse(
                    "unexpected EOF inside tag".to_string(),
                ));
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.compact();
        while self.pos >= self.buf.len() {
            if !self.fill()? {
                return Ok(Token::Eof);
            }
        }

        if self.buf[self.pos] != b'<' {
            let end = self.scan_for(b'<', self.pos)?.unwrap_or(self.buf.len());
            let text = String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned();
            self.pos = end;
            return Ok(Token::Text(text));
        }

        // Markup. Need at least one byte after '<'.
        while self.buf.len() < self.pos + 2 {
            if !self.fill()? {
                return Err(IngestError::DiffParse(
                    "unexpected EOF after '<'".to_string(),
                ));
            }
        }

        match self.buf[self.pos + 1] {
            b'!' => {
                // Comment or doctype; both are skipped.
                let comment_start = {
                    while self.buf.len() < self.pos + 4 && self.fill()? {}
                    self.buf.len() >= self.pos + 4 && &self.buf[self.pos..self.pos + 4] == b"<!--"
                };
                let end = if comment_start {
                    self.scan_past(b"-->", self.pos + 4)?
                } else {
                    self.scan_for(b'>', self.pos + 2)?.map(|i| i + 1)
                };
                match end {
                    Some(e) => {
                        self.pos = e;
                        self.next_token()
                    }
                    None => Err(IngestError::DiffParse(
                        "unterminated comment or declaration".to_string(),
                    )),
                }
            }
            b'?' => match self.scan_past(b"?>", self.pos + 2)? {
                Some(e) => {
                    self.pos = e;
                    self.next_token()
                }
                None => Err(IngestError::DiffParse(
                    "unterminated processing instruction".to_string(),
                )),
            },
            b'/' => {
                let end = self.scan_for(b'>', self.pos + 2)?.ok_or_else(|| {
                    IngestError::DiffParse("unexpected EOF inside closing tag".to_string())
                })?;
                let name = String::from_utf8_lossy(&self.buf[self.pos + 2..end])
                    .trim()
                    .to_string();
                self.pos = end + 1;
                Ok(Token::Close { name })
            }
            _ => {
                let end = self.scan_tag_end(self.pos + 1)?;
                let self_closing = self.buf[end - 1] == b'/';
                let inner_end = if self_closing { end - 1 } else { end };
                let (name, attrs) = parse_tag_inner(&self.buf[self.pos + 1..inner_end]);
                self.pos = end + 1;
                Ok(Token::Open {
                    name,
                    attrs,
                    self_closing,
                })
            }
        }
    }
}

/// Split `name attr="v" attr2='v'` into the tag name and its attributes.
///
/// Lenient: anything that stops looking like an attribute ends the scan
/// instead of failing, leaving later validation to notice missing fields.
fn parse_tag_inner(bytes: &[u8]) -> (String, Vec<(String, String)>) {
    let mut i = 0;
    let len = bytes.len();

    let name_start = i;
    while i < len && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let name = String::from_utf8_lossy(&bytes[name_start..i]).into_owned();

    let mut attrs = Vec::new();
    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            break;
        }

        let key_start = i;
        while i < len && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let key = String::from_utf8_lossy(&bytes[key_start..i]).into_owned();

        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len || bytes[i] != b'=' {
            break;
        }
        i += 1;
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len || (bytes[i] != b'"' && bytes[i] != b'\'') {
            break;
        }
        let quote = bytes[i];
        i += 1;
        let value_start = i;
        while i < len && bytes[i] != quote {
            i += 1;
        }
        if i >= len {
            break;
        }
        let value = unescape(&String::from_utf8_lossy(&bytes[value_start..i]));
        i += 1;

        if !key.is_empty() {
            attrs.push((key, value));
        }
    }

    (name, attrs)
}

/// Decode the five predefined entities plus numeric references.
/// Unknown entities pass through verbatim.
fn unescape(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail.find(';') {
            Some(semi) if semi <= 10 => {
                let entity = &tail[1..semi];
                match entity {
                    "amp" => out.push('&'),
                    "lt" => out.push('<'),
                    "gt" => out.push('>'),
                    "quot" => out.push('"'),
                    "apos" => out.push('\''),
                    _ => {
                        let decoded = entity
                            .strip_prefix("#x")
                            .or_else(|| entity.strip_prefix("#X"))
                            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                            .or_else(|| {
                                entity.strip_prefix('#').and_then(|dec| dec.parse().ok())
                            })
                            .and_then(char::from_u32);
                        match decoded {
                            Some(c) => out.push(c),
                            None => out.push_str(&tail[..=semi]),
                        }
                    }
                }
                rest = &tail[semi + 1..];
            }
            _ => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Changeset reader
// =============================================================================

/// Lazy decoder of changeset elements from an uncompressed byte stream.
///
/// Wrap the input with [`sniff_reader`] or [`decompress_payload`] first
/// when it may be compressed.
///
/// # Example
///
/// ```rust
/// use changeset_sync::diff::ChangesetReader;
///
/// let payload = br#"<osm><changeset id="42" created_at="2023-01-15T10:00:00Z"
///     open="true" num_changes="1" comments_count="0"/></osm>"#;
/// let mut reader = ChangesetReader::new(&payload[..]);
/// let event = reader.next_event().unwrap().unwrap();
/// assert_eq!(event.id, 42);
/// ```
pub struct ChangesetReader<R: Read> {
    tokenizer: Tokenizer<R>,
    skipped: u64,
    yielded: u64,
}

impl<R: Read> ChangesetReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            tokenizer: Tokenizer::new(reader),
            skipped: 0,
            yielded: 0,
        }
    }

    /// Elements dropped as malformed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Events returned so far.
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Next well-formed event, `Ok(None)` at end of stream.
    ///
    /// Malformed elements are counted, logged and skipped internally;
    /// errors mean the stream itself is unreadable.
    pub fn next_event(&mut self) -> Result<Option<ChangesetEvent>> {
        loop {
            match self.tokenizer.next_token()? {
                Token::Eof => return Ok(None),
                Token::Open {
                    name,
                    attrs,
                    self_closing,
                } if name == "changeset" => {
                    match self.read_element(attrs, self_closing)? {
                        Some(event) => {
                            self.yielded += 1;
                            return Ok(Some(event));
                        }
                        None => {
                            self.skipped += 1;
                            metrics::record_element_skipped();
                        }
                    }
                }
                // Container elements (<osm>, <osmChange>, ...) and stray
                // text are transparent at this level.
                _ => {}
            }
        }
    }

    /// Parse one changeset element (attributes already consumed).
    /// Returns None when the element is malformed.
    fn read_element(
        &mut self,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    ) -> Result<Option<ChangesetEvent>> {
        let mut builder = match EventBuilder::from_attrs(&attrs) {
            Some(b) => b,
            None => {
                // Still have to consume the subtree before resuming.
                if !self_closing {
                    self.skip_subtree("changeset")?;
                }
                return Ok(None);
            }
        };

        if self_closing {
            return Ok(builder.finish());
        }

        let mut in_discussion = false;
        let mut current_comment: Option<Comment> = None;
        let mut text_buf: Option<String> = None;

        loop {
            match self.tokenizer.next_token()? {
                Token::Eof => {
                    return Err(IngestError::DiffParse(
                        "unexpected EOF inside changeset element".to_string(),
                    ))
                }
                Token::Open {
                    name,
                    attrs,
                    self_closing,
                } => match name.as_str() {
                    "tag" => {
                        if let (Some(k), v) = (attr(&attrs, "k"), attr(&attrs, "v")) {
                            builder
                                .tags
                                .insert(k.to_string(), v.unwrap_or_default().to_string());
                        }
                        if !self_closing {
                            self.skip_subtree("tag")?;
                        }
                    }
                    "discussion" => {
                        if !self_closing {
                            in_discussion = true;
                        }
                    }
                    "comment" if in_discussion => {
                        let comment = Comment {
                            uid: attr(&attrs, "uid").and_then(|v| v.parse().ok()),
                            username: attr(&attrs, "user").map(str::to_string),
                            timestamp: attr(&attrs, "date").and_then(parse_timestamp),
                            text: None,
                        };
                        if self_closing {
                            builder.comments.push(comment);
                        } else {
                            current_comment = Some(comment);
                        }
                    }
                    "text" if current_comment.is_some() => {
                        if self_closing {
                            // Empty comment body.
                        } else {
                            text_buf = Some(String::new());
                        }
                    }
                    _ => {
                        if !self_closing {
                            self.skip_subtree(&name)?;
                        }
                    }
                },
                Token::Close { name } => match name.as_str() {
                    "changeset" => return Ok(builder.finish()),
                    "discussion" => in_discussion = false,
                    "comment" => {
                        if let Some(comment) = current_comment.take() {
                            builder.comments.push(comment);
                        }
                    }
                    "text" => {
                        if let (Some(text), Some(comment)) =
                            (text_buf.take(), current_comment.as_mut())
                        {
                            comment.text = Some(unescape(&text));
                        }
                    }
                    _ => {}
                },
                Token::Text(t) => {
                    if let Some(buf) = text_buf.as_mut() {
                        buf.push_str(&t);
                    }
                }
            }
        }
    }

    /// Consume tokens until the matching close tag, tolerating nesting.
    fn skip_subtree(&mut self, name: &str) -> Result<()> {
        let mut depth = 1usize;
        loop {
            match self.tokenizer.next_token()? {
                Token::Eof => {
                    return Err(IngestError::DiffParse(format!(
                        "unexpected EOF inside <{name}>"
                    )))
                }
                Token::Open {
                    name: n,
                    self_closing,
                    ..
                } => {
                    if n == name && !self_closing {
                        depth += 1;
                    }
                }
                Token::Close { name: n } => {
                    if n == name {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    }
                }
                Token::Text(_) => {}
            }
        }
    }
}

impl<R: Read> Iterator for ChangesetReader<R> {
    type Item = Result<ChangesetEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Accumulates a changeset element; validation happens in two stages so
/// attribute problems are caught before the subtree is consumed.
struct EventBuilder {
    id: i64,
    username: Option<String>,
    uid: Option<i64>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    open: bool,
    num_changes: u32,
    comments_count: u32,
    tags: BTreeMap<String, String>,
    comments: Vec<Comment>,
    geometry: Option<Geometry>,
}

impl EventBuilder {
    /// Stage one: attribute parsing and attribute-level invariants.
    fn from_attrs(attrs: &[(String, String)]) -> Option<Self> {
        let id: i64 = match attr(attrs, "id").and_then(|v| v.parse().ok()) {
            Some(id) if id > 0 => id,
            _ => {
                warn!(
                    id = attr(attrs, "id").unwrap_or("<missing>"),
                    "skipping changeset element with bad id"
                );
                return None;
            }
        };

        let created_at = match attr(attrs, "created_at").and_then(parse_timestamp) {
            Some(dt) => dt,
            None => {
                warn!(id, "skipping changeset element without parseable created_at");
                return None;
            }
        };

        let closed_at = match attr(attrs, "closed_at") {
            None => None,
            Some(raw) => match parse_timestamp(raw) {
                Some(dt) => Some(dt),
                None => {
                    warn!(id, closed_at = raw, "skipping changeset element with bad closed_at");
                    return None;
                }
            },
        };
        if let Some(closed) = closed_at {
            if closed < created_at {
                warn!(id, "skipping changeset element closed before it was created");
                return None;
            }
        }

        // An explicit open flag must agree with closed_at; when absent it
        // is derived from closed_at presence.
        let open = match attr(attrs, "open") {
            Some("true") => true,
            Some("false") => false,
            _ => closed_at.is_none(),
        };
        if !open && closed_at.is_none() {
            warn!(id, "skipping closed changeset element without closed_at");
            return None;
        }

        let num_changes = match parse_count(attr(attrs, "num_changes")) {
            Some(n) => n,
            None => {
                warn!(id, "skipping changeset element with bad num_changes");
                return None;
            }
        };
        let comments_count = match parse_count(attr(attrs, "comments_count")) {
            Some(n) => n,
            None => {
                warn!(id, "skipping changeset element with bad comments_count");
                return None;
            }
        };

        let geometry = match parse_geometry(attrs) {
            Ok(g) => g,
            Err(()) => {
                warn!(id, "skipping changeset element with bad bounding box");
                return None;
            }
        };

        Some(Self {
            id,
            username: attr(attrs, "user").map(str::to_string),
            uid: attr(attrs, "uid").and_then(|v| v.parse().ok()),
            created_at,
            closed_at,
            open,
            num_changes,
            comments_count,
            tags: BTreeMap::new(),
            comments: Vec::new(),
            geometry,
        })
    }

    /// Stage two: assemble after the subtree is consumed.
    fn finish(self) -> Option<ChangesetEvent> {
        Some(ChangesetEvent {
            id: self.id,
            username: self.username,
            uid: self.uid,
            created_at: self.created_at,
            closed_at: self.closed_at,
            open: self.open,
            num_changes: self.num_changes,
            comments_count: self.comments_count,
            tags: self.tags,
            comments: self.comments,
            geometry: self.geometry,
        })
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Missing counts default to zero; present-but-garbage is malformed.
fn parse_count(raw: Option<&str>) -> Option<u32> {
    match raw {
        None => Some(0),
        Some(v) => v.parse().ok(),
    }
}

/// All four corners present -> geometry; none -> no geometry;
/// partial or unparseable -> malformed.
fn parse_geometry(attrs: &[(String, String)]) -> std::result::Result<Option<Geometry>, ()> {
    let corners = [
        attr(attrs, "min_lon"),
        attr(attrs, "min_lat"),
        attr(attrs, "max_lon"),
        attr(attrs, "max_lat"),
    ];
    if corners.iter().all(|c| c.is_none()) {
        return Ok(None);
    }
    let mut values = [0f64; 4];
    for (slot, corner) in values.iter_mut().zip(corners) {
        *slot = corner.and_then(|v| v.parse().ok()).ok_or(())?;
    }
    let [min_lon, min_lat, max_lon, max_lat] = values;
    Ok(Some(Geometry::from_bounds(
        min_lon, min_lat, max_lon, max_lat,
    )))
}

/// Drop events whose bounding box exceeds the configured extent,
/// counting what was dropped. Applied before any gateway call.
pub fn filter_oversized(events: &mut Vec<ChangesetEvent>, max_extent_degrees: f64) -> usize {
    let before = events.len();
    events.retain(|event| match &event.geometry {
        Some(geometry) => !geometry.exceeds_extent(max_extent_degrees),
        None => true,
    });
    let dropped = before - events.len();
    if dropped > 0 {
        metrics::record_events_dropped_oversized(dropped);
    }
    dropped
}
