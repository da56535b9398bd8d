//! Process-global cache of parsed log files keyed by path. A cached entry is
//! reused as long as `(mtime_ns, size)` is unchanged, extended by parsing
//! only the appended tail when the file grew, and rebuilt from scratch when
//! the file shrank or was replaced.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::entry::{
    check_header, ChannelDef, ChannelTable, EntryScanner, ScannedEntry, HEADER_LEN,
};
use crate::error::TsdbResult;
use crate::value::Event;

#[derive(Debug, Clone, Default)]
pub struct CachedTsdbFile {
    pub mtime_ns: u128,
    pub size: u64,
    pub parsed_offset: u64,
    pub current_ts: Option<u64>,
    pub channel_defs: ChannelTable,
    pub series_format_ids: HashMap<String, u8>,
    pub series_events: HashMap<String, Vec<Event>>,
    pub ended_with_eof: bool,
}

static TSDB_FILE_CACHE: OnceLock<Mutex<HashMap<PathBuf, CachedTsdbFile>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<PathBuf, CachedTsdbFile>> {
    TSDB_FILE_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn mtime_ns(meta: &fs::Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Advance the cached parse state over `raw`, which starts at file offset
/// `base_offset`. Returns bytes consumed and whether parsing stopped on the
/// EOF marker. A truncated trailing entry is dropped silently: the offset
/// rewinds to its first byte so the next refresh retries it.
fn parse_chunk(
    cache: &mut CachedTsdbFile,
    raw: &[u8],
    base_offset: u64,
) -> TsdbResult<(usize, bool)> {
    let mut scanner = EntryScanner::resume(raw, base_offset as usize, cache.current_ts);
    let mut ended_with_eof = false;
    loop {
        match scanner.next_entry(&cache.channel_defs) {
            Ok(None) => break,
            Ok(Some(ScannedEntry::Value {
                channel_id,
                timestamp_ms,
                value,
            })) => {
                let Some(def) = cache.channel_defs.get(&channel_id) else {
                    continue;
                };
                let series = def.series.clone();
                cache
                    .series_events
                    .entry(series)
                    .or_default()
                    .push(Event::new(timestamp_ms, value));
            }
            Ok(Some(ScannedEntry::Define {
                channel_id,
                format_id,
                series,
            })) => {
                cache
                    .series_format_ids
                    .entry(series.clone())
                    .or_insert(format_id);
                cache.channel_defs.insert(
                    channel_id,
                    ChannelDef {
                        format_id,
                        series,
                    },
                );
            }
            Ok(Some(ScannedEntry::Time { .. })) => {}
            Ok(Some(ScannedEntry::Eof)) => {
                ended_with_eof = true;
                break;
            }
            Err(e) if e.is_truncation() => break,
            Err(e) => return Err(e),
        }
    }
    cache.current_ts = scanner.current_timestamp();
    Ok((scanner.offset(), ended_with_eof))
}

fn build_from_scratch(path: &Path, meta: &fs::Metadata) -> TsdbResult<CachedTsdbFile> {
    let raw = fs::read(path)?;
    check_header(&raw, path)?;

    let mut entry = CachedTsdbFile {
        mtime_ns: mtime_ns(meta),
        size: meta.len(),
        parsed_offset: HEADER_LEN as u64,
        ..CachedTsdbFile::default()
    };
    let (consumed, ended_with_eof) =
        parse_chunk(&mut entry, &raw[HEADER_LEN..], HEADER_LEN as u64)?;
    entry.parsed_offset = HEADER_LEN as u64 + consumed as u64;
    entry.ended_with_eof = ended_with_eof;
    Ok(entry)
}

fn refresh_incremental(
    path: &Path,
    meta: &fs::Metadata,
    cache: &mut CachedTsdbFile,
) -> TsdbResult<()> {
    let mut parse_from = cache.parsed_offset;
    // A cached parse that stopped on the EOF marker re-enters over that byte:
    // an appender will have truncated it before writing more entries.
    if cache.ended_with_eof && parse_from > HEADER_LEN as u64 {
        parse_from -= 1;
    }

    if parse_from >= meta.len() {
        cache.mtime_ns = mtime_ns(meta);
        cache.size = meta.len();
        return Ok(());
    }

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(parse_from))?;
    let mut raw = Vec::with_capacity((meta.len() - parse_from) as usize);
    file.read_to_end(&mut raw)?;

    debug!(
        path = %path.display(),
        from = parse_from,
        bytes = raw.len(),
        "incremental tail parse"
    );
    let (consumed, ended_with_eof) = parse_chunk(cache, &raw, parse_from)?;
    cache.parsed_offset = parse_from + consumed as u64;
    cache.ended_with_eof = ended_with_eof;
    cache.mtime_ns = mtime_ns(meta);
    cache.size = meta.len();
    Ok(())
}

/// Look up `path` in the cache, refreshing or rebuilding as needed, and hand
/// a consistent snapshot reference to `f` while the cache lock is held.
pub fn with_cached_file<T>(
    path: &Path,
    f: impl FnOnce(&CachedTsdbFile) -> T,
) -> TsdbResult<T> {
    let meta = fs::metadata(path)?;
    let mut map = cache().lock().unwrap_or_else(|e| e.into_inner());

    // A failed rebuild or refresh drops the stale entry; the next lookup
    // starts from scratch.
    let entry = match map.remove(path) {
        None => build_from_scratch(path, &meta)?,
        Some(entry) if entry.mtime_ns == mtime_ns(&meta) && entry.size == meta.len() => entry,
        Some(entry) if meta.len() < entry.parsed_offset => {
            warn!(path = %path.display(), "file shrank or was replaced, rebuilding cache");
            build_from_scratch(path, &meta)?
        }
        Some(mut entry) => {
            refresh_incremental(path, &meta, &mut entry)?;
            entry
        }
    };
    let result = f(&entry);
    map.insert(path.to_path_buf(), entry);
    Ok(result)
}
