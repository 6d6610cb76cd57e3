//! XMLTV parsing on a dedicated worker thread
//!
//! The document is read in one streaming pass that extracts raw `<channel>`
//! and `<programme>` nodes, then indexed in fixed-size batches. The worker
//! yields between batches and reports progress as a fraction in `0.0..=1.0`.
//! It talks to the async side only through [`EpgWorkerMessage`]s.

use bytes::Bytes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, SourceError, SourceResult};
use crate::matching::MatchingIndex;
use crate::models::{EpgChannel, EpgParseSummary, EpgProgramme};

const VALIDATED: f64 = 0.05;
const EXTRACTED: f64 = 0.2;
const CHANNELS_INDEXED: f64 = 0.6;
const PROGRAMMES_INDEXED: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct EpgProgress {
    pub fraction: f64,
    pub stage: String,
}

#[derive(Debug)]
pub enum EpgWorkerMessage {
    Progress(EpgProgress),
    Result(Box<EpgParseOutput>),
    Error(SourceError),
}

/// Everything extracted from one document
#[derive(Debug, Clone, Default)]
pub struct EpgParseOutput {
    pub channels: Vec<EpgChannel>,
    pub programmes: Vec<EpgProgramme>,
    pub index: MatchingIndex,
    /// Channel id -> positions in `programmes`, in document order
    pub programmes_by_channel: HashMap<String, Vec<usize>>,
    pub summary: EpgParseSummary,
}

impl EpgParseOutput {
    pub fn programmes_for<'a>(&'a self, channel_id: &str) -> impl Iterator<Item = &'a EpgProgramme> + 'a {
        self.programmes_by_channel
            .get(channel_id)
            .into_iter()
            .flatten()
            .map(|&position| &self.programmes[position])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EpgParser {
    batch_size: usize,
}

impl Default for EpgParser {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EpgParser {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Run the parse on a new `epg-parser` thread
    pub fn spawn(&self, content: Bytes) -> AppResult<EpgParseHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let parser = *self;

        let worker = thread::Builder::new()
            .name("epg-parser".to_string())
            .spawn(move || {
                let progress_tx = tx.clone();
                let outcome = parser.parse(&content, |progress| {
                    // receiver gone means the caller abandoned the result
                    let _ = progress_tx.send(EpgWorkerMessage::Progress(progress));
                });
                let message = match outcome {
                    Ok(output) => EpgWorkerMessage::Result(Box::new(output)),
                    Err(e) => EpgWorkerMessage::Error(e),
                };
                let _ = tx.send(message);
            })
            .map_err(|e| AppError::internal(format!("failed to start EPG worker: {e}")))?;

        Ok(EpgParseHandle {
            receiver: rx,
            worker: Some(worker),
        })
    }

    /// Parse synchronously on the current thread, reporting progress through `on_progress`
    pub fn parse<F>(&self, content: &[u8], mut on_progress: F) -> SourceResult<EpgParseOutput>
    where
        F: FnMut(EpgProgress),
    {
        let mut report = |fraction: f64, stage: String| {
            debug!("EPG parse {:.1}%: {}", fraction * 100.0, stage);
            on_progress(EpgProgress { fraction, stage });
        };

        report(0.0, "Starting EPG parse".to_string());

        let (channels, programmes) = self.extract_nodes(content, &mut report)?;
        if channels.is_empty() && programmes.is_empty() {
            return Err(SourceError::parse_error(
                "xmltv",
                "document contains no channels or programmes",
            ));
        }
        report(
            EXTRACTED,
            format!(
                "Extracted {} channels and {} programmes",
                channels.len(),
                programmes.len()
            ),
        );

        let index = self.index_channels(&channels, &mut report);
        let (programmes_by_channel, orphan_programme_count) =
            self.index_programmes(&programmes, &channels, &mut report);

        let summary = EpgParseSummary {
            channel_count: channels.len(),
            programme_count: programmes.len(),
            key_count: index.key_count(),
            programme_channel_count: programmes_by_channel.len(),
            orphan_programme_count,
        };
        if orphan_programme_count > 0 {
            warn!(
                "{} programmes reference channels with no <channel> definition",
                orphan_programme_count
            );
        }
        report(
            1.0,
            format!(
                "Completed: {} channels, {} programmes, {} keys, {} programme channels",
                summary.channel_count,
                summary.programme_count,
                summary.key_count,
                summary.programme_channel_count
            ),
        );
        info!(
            "Parsed EPG with {} channels and {} programmes",
            summary.channel_count, summary.programme_count
        );

        Ok(EpgParseOutput {
            channels,
            programmes,
            index,
            programmes_by_channel,
            summary,
        })
    }

    fn extract_nodes<F>(
        &self,
        content: &[u8],
        report: &mut F,
    ) -> SourceResult<(Vec<EpgChannel>, Vec<EpgProgramme>)>
    where
        F: FnMut(f64, String),
    {
        let total_bytes = content.len().max(1) as f64;
        let mut reader = Reader::from_reader(content);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut root_seen = false;
        let mut channels = Vec::new();
        let mut programmes = Vec::new();
        let mut current_channel: Option<EpgChannel> = None;
        let mut current_programme: Option<EpgProgramme> = None;
        let mut text = String::new();
        let mut nodes_since_report = 0usize;

        loop {
            buf.clear();
            let event = reader.read_event_into(&mut buf).map_err(|e| {
                let message = format!("XML error at byte {}: {e}", reader.buffer_position());
                if root_seen {
                    SourceError::parse_error("xmltv", message)
                } else {
                    SourceError::invalid_format(message)
                }
            })?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) if !root_seen => {
                    if e.name().as_ref() != b"tv" {
                        return Err(SourceError::invalid_format(format!(
                            "expected <tv> root element, found <{}>",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    root_seen = true;
                    report(VALIDATED, "Validated XMLTV document".to_string());
                }
                Event::Start(ref e) => match e.name().as_ref() {
                    b"channel" => current_channel = Some(channel_from(e)),
                    b"programme" => current_programme = Some(programme_from(e)),
                    _ => text.clear(),
                },
                Event::Empty(ref e) => match e.name().as_ref() {
                    b"channel" => channels.push(channel_from(e)),
                    b"programme" => {
                        let programme = programme_from(e);
                        if !programme.channel.is_empty() {
                            programmes.push(programme);
                        }
                    }
                    b"icon" => {
                        let src = attributes(e).remove("src").filter(|s| !s.is_empty());
                        if let Some(programme) = current_programme.as_mut() {
                            programme.icon = programme.icon.take().or(src);
                        } else if let Some(channel) = current_channel.as_mut() {
                            channel.icon = channel.icon.take().or(src);
                        }
                    }
                    _ => {}
                },
                Event::Text(ref e) => {
                    let unescaped = e
                        .unescape()
                        .map_err(|err| SourceError::parse_error("xmltv", err.to_string()))?;
                    text.push_str(&unescaped);
                }
                Event::CData(ref e) => text.push_str(&String::from_utf8_lossy(e)),
                Event::End(ref e) => {
                    let value = text.trim();
                    match e.name().as_ref() {
                        b"display-name" if !value.is_empty() => {
                            if let Some(channel) = current_channel.as_mut() {
                                channel.display_names.push(value.to_string());
                            }
                        }
                        b"url" if !value.is_empty() => {
                            if let Some(channel) = current_channel.as_mut() {
                                channel.url.get_or_insert_with(|| value.to_string());
                            }
                        }
                        b"title" if !value.is_empty() => {
                            if let Some(programme) = current_programme.as_mut() {
                                programme.title.get_or_insert_with(|| value.to_string());
                            }
                        }
                        b"desc" if !value.is_empty() => {
                            if let Some(programme) = current_programme.as_mut() {
                                programme.description.get_or_insert_with(|| value.to_string());
                            }
                        }
                        b"category" if !value.is_empty() => {
                            if let Some(programme) = current_programme.as_mut() {
                                programme.categories.push(value.to_string());
                            }
                        }
                        b"channel" => {
                            if let Some(channel) = current_channel.take() {
                                channels.push(channel);
                                nodes_since_report += 1;
                            }
                        }
                        b"programme" => {
                            if let Some(programme) = current_programme.take() {
                                if programme.channel.is_empty() {
                                    debug!("Dropping programme without channel attribute");
                                } else {
                                    programmes.push(programme);
                                }
                                nodes_since_report += 1;
                            }
                        }
                        _ => {}
                    }
                    text.clear();
                }
                Event::Eof => break,
                _ => {}
            }

            if nodes_since_report >= self.batch_size {
                nodes_since_report = 0;
                let read = reader.buffer_position() as f64 / total_bytes;
                report(
                    VALIDATED + (EXTRACTED - VALIDATED) * read.min(1.0),
                    format!(
                        "Reading document: {} channels, {} programmes so far",
                        channels.len(),
                        programmes.len()
                    ),
                );
                thread::yield_now();
            }
        }

        if !root_seen {
            return Err(SourceError::invalid_format("document has no <tv> root element"));
        }

        Ok((channels, programmes))
    }

    fn index_channels<F>(&self, channels: &[EpgChannel], report: &mut F) -> MatchingIndex
    where
        F: FnMut(f64, String),
    {
        let mut index = MatchingIndex::with_capacity(channels.len());
        let total = channels.len();
        let mut done = 0;

        for batch in channels.chunks(self.batch_size) {
            for channel in batch {
                if !index.insert(channel.clone()) {
                    debug!("Skipping channel definition without id");
                }
            }
            done += batch.len();
            report(
                EXTRACTED + (CHANNELS_INDEXED - EXTRACTED) * (done as f64 / total as f64),
                format!("Indexed {done}/{total} channels"),
            );
            thread::yield_now();
        }

        if total == 0 {
            report(CHANNELS_INDEXED, "No channel definitions to index".to_string());
        }
        index
    }

    fn index_programmes<F>(
        &self,
        programmes: &[EpgProgramme],
        channels: &[EpgChannel],
        report: &mut F,
    ) -> (HashMap<String, Vec<usize>>, usize)
    where
        F: FnMut(f64, String),
    {
        let defined: HashSet<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        let mut by_channel: HashMap<String, Vec<usize>> = HashMap::new();
        let mut orphans = 0;
        let total = programmes.len();
        let mut done = 0;

        for batch in programmes.chunks(self.batch_size) {
            for (offset, programme) in batch.iter().enumerate() {
                if !defined.contains(programme.channel.as_str()) {
                    orphans += 1;
                }
                by_channel
                    .entry(programme.channel.clone())
                    .or_default()
                    .push(done + offset);
            }
            done += batch.len();
            report(
                CHANNELS_INDEXED
                    + (PROGRAMMES_INDEXED - CHANNELS_INDEXED) * (done as f64 / total as f64),
                format!("Indexed {done}/{total} programmes"),
            );
            thread::yield_now();
        }

        if total == 0 {
            report(PROGRAMMES_INDEXED, "No programmes to index".to_string());
        }
        (by_channel, orphans)
    }
}

/// Receiving end of a worker started with [`EpgParser::spawn`]
pub struct EpgParseHandle {
    receiver: mpsc::UnboundedReceiver<EpgWorkerMessage>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EpgParseHandle {
    pub async fn recv(&mut self) -> Option<EpgWorkerMessage> {
        self.receiver.recv().await
    }

    /// Drain messages until the terminal one, forwarding progress to `on_progress`
    pub async fn finish<F>(mut self, mut on_progress: F) -> SourceResult<EpgParseOutput>
    where
        F: FnMut(EpgProgress),
    {
        let outcome = loop {
            match self.receiver.recv().await {
                Some(EpgWorkerMessage::Progress(progress)) => on_progress(progress),
                Some(EpgWorkerMessage::Result(output)) => break Ok(*output),
                Some(EpgWorkerMessage::Error(e)) => break Err(e),
                None => {
                    break Err(SourceError::parse_error(
                        "xmltv",
                        "EPG worker exited without a result",
                    ))
                }
            }
        };

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("EPG worker thread panicked");
            }
        }
        outcome
    }
}

fn attributes(element: &BytesStart) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in element.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        attrs.insert(key, value);
    }
    attrs
}

fn channel_from(element: &BytesStart) -> EpgChannel {
    let mut attrs = attributes(element);
    EpgChannel {
        id: attrs.remove("id").map(|id| id.trim().to_string()).unwrap_or_default(),
        ..Default::default()
    }
}

fn programme_from(element: &BytesStart) -> EpgProgramme {
    let mut attrs = attributes(element);
    let channel = attrs
        .remove("channel")
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    let start = attrs.remove("start").unwrap_or_default();
    let stop = attrs.remove("stop").filter(|s| !s.is_empty());

    EpgProgramme {
        id: EpgProgramme::derive_id(&channel, &start, stop.as_deref()),
        channel,
        start,
        stop,
        ..Default::default()
    }
}
