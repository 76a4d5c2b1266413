//! # Link Extraction
//!
//! Streams the message logs inside an export archive and produces candidate
//! image links on one channel and non-fatal row/entry errors on another.
//! Both channels close once every matching entry has been read.

use std::io::{Read, Seek};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use csv::StringRecord;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to open {entry}: {source}")]
    Entry {
        entry: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("failed to read header of {entry}: {source}")]
    Header {
        entry: String,
        #[source]
        source: csv::Error,
    },
    #[error("failed to read message {record} in {entry}: {source}")]
    Row {
        entry: String,
        record: u64,
        #[source]
        source: csv::Error,
    },
}

impl ExtractionError {
    pub fn entry(&self) -> &str {
        match self {
            Self::Entry { entry, .. } | Self::Header { entry, .. } | Self::Row { entry, .. } => {
                entry
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub entry_suffix: String,
    pub image_suffix: String,
    pub content_column: usize,
    pub attachments_column: usize,
}

impl ExtractSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            entry_suffix: cfg.message_log_suffix.clone(),
            image_suffix: cfg.image_suffix.clone(),
            content_column: cfg.content_column,
            attachments_column: cfg.attachments_column,
        }
    }
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            entry_suffix: "messages.csv".to_string(),
            image_suffix: ".png".to_string(),
            content_column: 2,
            attachments_column: 3,
        }
    }
}

/// Classifies row fields into candidate links.
#[derive(Debug, Clone)]
pub struct LinkMatcher {
    suffix: String,
    pattern: Regex,
    content_column: usize,
    attachments_column: usize,
}

impl LinkMatcher {
    pub fn new(settings: &ExtractSettings) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"https?://\S+{}",
            regex::escape(&settings.image_suffix)
        ))?;
        Ok(Self {
            suffix: settings.image_suffix.clone(),
            pattern,
            content_column: settings.content_column,
            attachments_column: settings.attachments_column,
        })
    }

    /// Attachment tokens first, then free-text matches. Missing columns yield nothing.
    pub fn row_links<'r>(&'r self, record: &'r StringRecord) -> impl Iterator<Item = &'r str> + 'r {
        let attachments = record.get(self.attachments_column).unwrap_or("");
        let content = record.get(self.content_column).unwrap_or("");
        attachments
            .split_whitespace()
            .filter(move |token| token.ends_with(self.suffix.as_str()))
            .chain(self.pattern.find_iter(content).map(|m| m.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub entries: u64,
    pub rows: u64,
    pub links: u64,
    pub errors: u64,
    pub cancelled: bool,
}

pub struct LinkExtractor<R> {
    archive: ZipArchive<R>,
    settings: ExtractSettings,
    matcher: LinkMatcher,
}

impl<R: Read + Seek> LinkExtractor<R> {
    pub fn new(archive: ZipArchive<R>, settings: ExtractSettings) -> Result<Self, regex::Error> {
        let matcher = LinkMatcher::new(&settings)?;
        Ok(Self {
            archive,
            settings,
            matcher,
        })
    }

    /// Names of the message-log entries, in archive order.
    pub fn message_logs(&self) -> Vec<String> {
        self.archive
            .file_names()
            .filter(|name| name.ends_with(self.settings.entry_suffix.as_str()))
            .map(str::to_string)
            .collect()
    }

    /// Drain every message log into the channels. Returns when the archive is
    /// exhausted, the run is cancelled, or nobody is listening for links.
    pub fn run(
        mut self,
        links: &Sender<String>,
        errors: &Sender<ExtractionError>,
        cancel: Option<&AtomicBool>,
    ) -> ExtractStats {
        let mut stats = ExtractStats::default();
        let report = |stats: &mut ExtractStats, err: ExtractionError| {
            stats.errors += 1;
            // error receiver going away must not stop link production
            if let Err(unsent) = errors.send(err) {
                debug!("error channel closed; dropping {}", unsent.into_inner());
            }
        };

        for name in self.message_logs() {
            if is_cancelled(cancel) {
                stats.cancelled = true;
                break;
            }
            let entry = match self.archive.by_name(&name) {
                Ok(entry) => entry,
                Err(source) => {
                    report(&mut stats, ExtractionError::Entry { entry: name, source });
                    continue;
                }
            };
            stats.entries += 1;
            debug!("reading message log {name}");

            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(entry);
            let mut record = StringRecord::new();

            match reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(source) => {
                    report(&mut stats, ExtractionError::Header { entry: name, source });
                    continue;
                }
            }

            let mut row = 0u64;
            loop {
                if is_cancelled(cancel) {
                    stats.cancelled = true;
                    return stats;
                }
                row += 1;
                match reader.read_record(&mut record) {
                    Ok(false) => break,
                    Ok(true) => {
                        stats.rows += 1;
                        for link in self.matcher.row_links(&record) {
                            if links.send(link.to_string()).is_err() {
                                debug!("link channel closed; stopping extraction");
                                stats.cancelled = true;
                                return stats;
                            }
                            stats.links += 1;
                        }
                    }
                    Err(source) => {
                        let unreadable = source.is_io_error();
                        report(
                            &mut stats,
                            ExtractionError::Row {
                                entry: name.clone(),
                                record: row,
                                source,
                            },
                        );
                        if unreadable {
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "extraction finished entries={} rows={} links={} errors={}",
            stats.entries, stats.rows, stats.links, stats.errors
        );
        stats
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Run the extractor on its own thread. The senders are moved in so both
/// channels close when the thread finishes.
pub fn spawn_extractor<R>(
    extractor: LinkExtractor<R>,
    links: Sender<String>,
    errors: Sender<ExtractionError>,
    cancel: Option<Arc<AtomicBool>>,
) -> thread::JoinHandle<ExtractStats>
where
    R: Read + Seek + Send + 'static,
{
    thread::spawn(move || extractor.run(&links, &errors, cancel.as_deref()))
}

/// Independently consumable link and error sequences. The error side is
/// unbounded, so reading every link before any error never stalls the
/// extractor.
pub struct LinkStreams {
    pub links: Receiver<String>,
    pub errors: Receiver<ExtractionError>,
    pub handle: thread::JoinHandle<ExtractStats>,
}

pub fn extract_links<R>(
    archive: ZipArchive<R>,
    settings: ExtractSettings,
    capacity: usize,
) -> Result<LinkStreams, regex::Error>
where
    R: Read + Seek + Send + 'static,
{
    let extractor = LinkExtractor::new(archive, settings)?;
    let (links_tx, links_rx) = bounded(capacity);
    let (errors_tx, errors_rx) = unbounded();
    let handle = spawn_extractor(extractor, links_tx, errors_tx, None);
    Ok(LinkStreams {
        links: links_rx,
        errors: errors_rx,
        handle,
    })
}
