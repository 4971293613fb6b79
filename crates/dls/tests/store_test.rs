//! Integration tests for the write path followed by the read path.
//!
//! Samples go in through a [`Job`] exactly as the acquisition loop feeds
//! them, and come back out through [`Directory`], [`Channel`] and [`Chunk`].

use dls::reader::remote::{serve_connection, RemoteClient, RemoteConfig};
use dls::store::layout;
use dls::store::message::{Message, MessageKind};
use dls::store::{encode_samples, ByteOrder};
use dls::writer::Command;
use dls::{
    CatalogConfig, ChannelPreset, Chunk, Collect, Data, Directory, Format, HardwareChannel, Job,
    JobDir, MetaType, SaverConfig, ScalarType, TailState, Time,
};
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use tempfile::TempDir;

const T0: Time = 1_700_000_000_000_000;
/// 100 Hz
const PERIOD: Time = 10_000;

fn signal(i: usize) -> f64 {
    (i as f64 * 0.05).sin() * 10.0 + (i as f64 * 0.31).cos()
}

fn hardware() -> Vec<HardwareChannel> {
    vec![HardwareChannel {
        name: "/temp".to_string(),
        unit: "K".to_string(),
        index: 0,
        scalar: ScalarType::Double,
        max_frequency: 1000.0,
        buffer_size: 1_000_000,
    }]
}

/// Records `count` samples in batches of `batch` into job 1.
fn record(dls_dir: &Path, preset: ChannelPreset, count: usize, batch: usize) -> Job<Vec<Command>> {
    let mut job = Job::new(dls_dir, 1, Vec::new(), hardware(), SaverConfig::default());
    job.sync(&[preset]).unwrap();
    for start in (0..count).step_by(batch) {
        let end = (start + batch).min(count);
        let values: Vec<f64> = (start..end).map(signal).collect();
        let bytes = encode_samples(&values, ByteOrder::native());
        job.process_data(0, &bytes, T0 + (end as Time - 1) * PERIOD)
            .unwrap();
    }
    job
}

fn zlib_preset() -> ChannelPreset {
    ChannelPreset::new("/temp", 100.0).with_block_size(10)
}

fn mdct_preset() -> ChannelPreset {
    zlib_preset()
        .with_block_size(64)
        .with_format(Format::Mdct {
            block_size: 32,
            accuracy: 0.01,
        })
}

fn open_job(dls_dir: &Path) -> JobDir {
    let directory = Directory::open(dls_dir, CatalogConfig::default()).unwrap();
    let mut job = directory.job(1).unwrap();
    job.fetch_channels().unwrap();
    for channel in job.channels_mut() {
        channel.fetch_chunks().unwrap();
    }
    job
}

fn flatten(blocks: &[Data]) -> Vec<(Time, f64)> {
    blocks.iter().flat_map(|d| d.iter()).collect()
}

// ============================================================================
// Level 0
// ============================================================================

/// Tests that lossless data reads back exactly, with the sample times.
#[test]
fn test_zlib_write_then_read_exact() {
    let temp_dir = TempDir::new().unwrap();
    let mut writer = record(temp_dir.path(), zlib_preset(), 2000, 100);
    writer.finish().unwrap();

    let job = open_job(temp_dir.path());
    let channel = job.find_channel("/temp").unwrap();
    assert_eq!(channel.index(), 0);
    assert_eq!(channel.unit(), "K");
    assert_eq!(channel.range(), Some((T0, T0 + 1999 * PERIOD)));

    let mut blocks = Collect::default();
    let summary = channel
        .fetch_data(T0, T0 + 2000 * PERIOD, 0, 1, &mut blocks)
        .unwrap();
    assert_eq!(summary.level, 0);
    assert_eq!(summary.values, 2000);
    assert_eq!(summary.blocks, 200);
    assert_eq!(summary.tail, TailState::NotApplicable);

    let values = flatten(&blocks.0);
    assert_eq!(values.len(), 2000);
    for (i, (time, value)) in values.iter().enumerate() {
        assert_eq!(*time, T0 + i as Time * PERIOD);
        assert_eq!(*value, signal(i));
    }
    assert!(blocks.0.iter().all(|d| d.meta_type == MetaType::Gen));
}

/// Tests that the query range is half-open.
#[test]
fn test_range_is_half_open() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), zlib_preset(), 500, 50).finish().unwrap();

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();

    let mut blocks = Collect::default();
    channel
        .fetch_data(T0 + 15 * PERIOD, T0 + 25 * PERIOD, 0, 1, &mut blocks)
        .unwrap();
    let values = flatten(&blocks.0);
    assert_eq!(values.len(), 10);
    assert_eq!(values[0], (T0 + 15 * PERIOD, signal(15)));
    assert_eq!(values[9].0, T0 + 24 * PERIOD);

    // Entirely before the data.
    let mut blocks = Collect::default();
    let summary = channel.fetch_data(0, T0, 0, 1, &mut blocks).unwrap();
    assert_eq!(summary.values, 0);
    assert!(blocks.0.is_empty());
}

/// Tests that decimation over several blocks equals decimating the full
/// result.
#[test]
fn test_decimation_continuity() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), zlib_preset(), 300, 37).finish().unwrap();

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();
    let (start, end) = (T0 + 3 * PERIOD, T0 + 290 * PERIOD);

    let mut full = Collect::default();
    channel.fetch_data(start, end, 0, 1, &mut full).unwrap();
    let full = flatten(&full.0);

    for decimation in 2..=7u32 {
        let mut blocks = Collect::default();
        channel
            .fetch_data(start, end, 0, decimation, &mut blocks)
            .unwrap();
        let expected: Vec<(Time, f64)> = full.iter().copied().step_by(decimation as usize).collect();
        assert_eq!(flatten(&blocks.0), expected, "decimation {}", decimation);
    }

    // Zero behaves like one.
    let mut blocks = Collect::default();
    channel.fetch_data(start, end, 0, 0, &mut blocks).unwrap();
    assert_eq!(flatten(&blocks.0), full);
}

// ============================================================================
// Meta levels
// ============================================================================

/// Tests that a coarse query reads min and max values of a higher level.
#[test]
fn test_min_max_levels() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), zlib_preset(), 2000, 100).finish().unwrap();

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();
    let (start, end) = (T0, T0 + 2000 * PERIOD);

    // 100 Hz * 20 s / 150 = 13.3 values per output value: level 1.
    let mut blocks = Collect::default();
    let summary = channel.fetch_data(start, end, 150, 1, &mut blocks).unwrap();
    assert_eq!(summary.level, 1);

    let min: Vec<f64> = blocks
        .0
        .iter()
        .filter(|d| d.meta_type == MetaType::Min)
        .flat_map(|d| d.values.iter().copied())
        .collect();
    let max: Vec<f64> = blocks
        .0
        .iter()
        .filter(|d| d.meta_type == MetaType::Max)
        .flat_map(|d| d.values.iter().copied())
        .collect();
    assert_eq!(min.len(), 200);
    assert_eq!(max.len(), 200);
    for group in 0..200 {
        let raw: Vec<f64> = (group * 10..group * 10 + 10).map(signal).collect();
        assert_eq!(min[group], raw.iter().copied().fold(f64::MAX, f64::min));
        assert_eq!(max[group], raw.iter().copied().fold(f64::MIN, f64::max));
    }
    assert!(blocks.0.iter().all(|d| d.meta_level == 1));
    assert_eq!(blocks.0[0].time_per_value, 10.0 * PERIOD as f64);

    // The deepest level written is 3 (2000 / 10^3 = 2 values).
    let mut blocks = Collect::default();
    let summary = channel.fetch_data(start, end, 1, 1, &mut blocks).unwrap();
    assert_eq!(summary.level, 3);
    assert_eq!(summary.values, 4);
}

// ============================================================================
// Lapped format
// ============================================================================

/// Tests that the lapped format completes the last block from the flush
/// record and stays within its accuracy.
#[test]
fn test_mdct_within_accuracy() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), mdct_preset(), 1000, 100).finish().unwrap();

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();

    let mut blocks = Collect::default();
    let summary = channel
        .fetch_data(T0, T0 + 1000 * PERIOD, 0, 1, &mut blocks)
        .unwrap();
    assert_eq!(summary.tail, TailState::Completed);
    let values = flatten(&blocks.0);
    assert_eq!(values.len(), 1000);
    for (i, (time, value)) in values.iter().enumerate() {
        assert_eq!(*time, T0 + i as Time * PERIOD);
        assert!((value - signal(i)).abs() <= 0.01, "{}: {}", i, value);
    }

    // A range ending mid-stream completes its last block from the next one.
    let mut blocks = Collect::default();
    let summary = channel
        .fetch_data(T0 + 100 * PERIOD, T0 + 300 * PERIOD, 0, 1, &mut blocks)
        .unwrap();
    assert_eq!(summary.tail, TailState::Completed);
    let values = flatten(&blocks.0);
    assert_eq!(values.len(), 200);
    assert_eq!(values[0].0, T0 + 100 * PERIOD);
    for (time, value) in values {
        let i = ((time - T0) / PERIOD) as usize;
        assert!((value - signal(i)).abs() <= 0.01);
    }
}

// ============================================================================
// Chunks being written
// ============================================================================

/// Tests that an open chunk reports the end of its last written block.
#[test]
fn test_open_chunk_range() {
    let temp_dir = TempDir::new().unwrap();
    // 99 full blocks are written, 5 samples stay buffered.
    let _writer = record(temp_dir.path(), zlib_preset(), 995, 100);

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();
    let chunk = channel.chunk(T0).unwrap();
    assert!(chunk.is_incomplete());
    assert_eq!(chunk.start(), T0);
    assert_eq!(chunk.end(), T0 + 989 * PERIOD);

    let mut blocks = Collect::default();
    let summary = channel.fetch_data(T0, Time::MAX, 0, 1, &mut blocks).unwrap();
    assert_eq!(summary.values, 990);
}

/// Tests that the withheld tail of an open lapped stream is reported as
/// pending rather than emitted.
#[test]
fn test_open_chunk_mdct_tail_pending() {
    let temp_dir = TempDir::new().unwrap();
    let _writer = record(temp_dir.path(), mdct_preset(), 640, 64);

    let job = open_job(temp_dir.path());
    let channel = job.channel(0).unwrap();
    let mut blocks = Collect::default();
    let summary = channel.fetch_data(T0, Time::MAX, 0, 1, &mut blocks).unwrap();
    assert_eq!(summary.tail, TailState::Pending);
    assert!(summary.values < 640);
    for (time, value) in flatten(&blocks.0) {
        let i = ((time - T0) / PERIOD) as usize;
        assert!((value - signal(i)).abs() <= 0.01);
    }
}

/// Tests that a closed chunk whose trailing record was cut short still
/// returns its values, with the tail reported as truncated.
#[test]
fn test_closed_chunk_partial_flush_record() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), mdct_preset(), 640, 64).finish().unwrap();

    let chunk_dir = layout::chunk_dir(
        &layout::channel_dir(&layout::job_dir(temp_dir.path(), 1), 0),
        T0,
    );
    let data_path = layout::data_file_path(&layout::level_dir(&chunk_dir, 0), T0, MetaType::Gen);
    let text = fs::read_to_string(&data_path).unwrap();
    let last_line = text.trim_end().rfind('\n').unwrap() + 1;
    assert!(text[last_line..].contains("s=\"0\""));
    let cut = last_line + (text.len() - last_line) / 2;
    fs::write(&data_path, &text[..cut]).unwrap();

    let mut chunk = Chunk::import(&chunk_dir, ScalarType::Double).unwrap();
    chunk.fetch_range().unwrap();
    assert!(!chunk.is_incomplete());
    let mut blocks = Collect::default();
    let summary = chunk.fetch_data(T0, Time::MAX, 0, 1, &mut blocks).unwrap();
    assert_eq!(summary.tail, TailState::Truncated);
    let values = flatten(&blocks.0);
    assert_eq!(values.len(), summary.values);
    assert!(!values.is_empty() && values.len() < 640);
    for (time, value) in values {
        let i = ((time - T0) / PERIOD) as usize;
        assert!((value - signal(i)).abs() <= 0.01);
    }
}

/// Tests that a cached open chunk is re-read on the next discovery.
#[test]
fn test_index_cache_marks_open_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let mut writer = record(temp_dir.path(), zlib_preset(), 500, 100);

    let job = open_job(temp_dir.path());
    job.channel(0).unwrap().update_index().unwrap();
    drop(job);

    writer.finish().unwrap();

    let job = open_job(temp_dir.path());
    let chunk = job.channel(0).unwrap().chunk(T0).unwrap();
    assert!(!chunk.is_incomplete());
    assert_eq!(chunk.end(), T0 + 499 * PERIOD);
}

// ============================================================================
// Failures
// ============================================================================

/// Tests that a broken block aborts the chunk read but keeps earlier blocks.
#[test]
fn test_decode_failure_keeps_earlier_blocks() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), zlib_preset(), 100, 100).finish().unwrap();

    let chunk_dir = layout::chunk_dir(
        &layout::channel_dir(&layout::job_dir(temp_dir.path(), 1), 0),
        T0,
    );
    let data_path = layout::data_file_path(&layout::level_dir(&chunk_dir, 0), T0, MetaType::Gen);
    let text = fs::read_to_string(&data_path).unwrap();
    let payload = text.rfind("d=\"").unwrap();
    fs::write(&data_path, format!("{}d=\"!!!!\"/>\n", &text[..payload])).unwrap();

    let mut chunk = Chunk::import(&chunk_dir, ScalarType::Double).unwrap();
    chunk.fetch_range().unwrap();
    let mut blocks = Collect::default();
    assert!(chunk.fetch_data(T0, Time::MAX, 0, 1, &mut blocks).is_err());
    assert_eq!(flatten(&blocks.0).len(), 90);

    // The channel logs the failure and returns what it read.
    let job = open_job(temp_dir.path());
    let mut blocks = Collect::default();
    let summary = job
        .channel(0)
        .unwrap()
        .fetch_data(T0, Time::MAX, 0, 1, &mut blocks)
        .unwrap();
    assert_eq!(summary.values, 0);
    assert_eq!(flatten(&blocks.0).len(), 90);
}

// ============================================================================
// Messages and remote access
// ============================================================================

/// Tests that job messages are readable through the directory.
#[test]
fn test_job_messages() {
    let temp_dir = TempDir::new().unwrap();
    let mut writer = record(temp_dir.path(), zlib_preset(), 100, 100);
    writer.message(&Message::new(T0, MessageKind::Info, "started"));
    writer.message(&Message::new(T0 + 5, MessageKind::Error, "overrun"));
    writer.finish().unwrap();

    let job = open_job(temp_dir.path());
    let messages = job.load_messages(T0, T0 + 10).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].kind, MessageKind::Error);
    assert_eq!(messages[1].text, "overrun");
}

/// Tests that a remote directory answers like the local one.
#[test]
fn test_remote_matches_local() {
    let temp_dir = TempDir::new().unwrap();
    record(temp_dir.path(), zlib_preset(), 1000, 100).finish().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let local = Directory::open(temp_dir.path(), CatalogConfig::default()).unwrap();
    let server = thread::spawn(move || {
        // list jobs, list channels, list chunks, fetch data
        for stream in listener.incoming().take(4) {
            serve_connection(stream.unwrap(), &local).unwrap();
        }
    });

    let remote = Directory::connect(
        RemoteClient::new(addr.to_string(), RemoteConfig::default()),
        CatalogConfig::default(),
    );
    assert_eq!(remote.job_ids().unwrap(), vec![1]);
    let mut job = remote.job(1).unwrap();
    job.fetch_channels().unwrap();
    let channel = job.channel_mut(0).unwrap();
    assert!(channel.is_remote());
    assert_eq!(channel.name(), "/temp");
    let update = channel.fetch_chunks().unwrap();
    assert_eq!(update.touched, vec![T0]);

    let mut blocks = Collect::default();
    let summary = channel
        .fetch_data(T0, T0 + 500 * PERIOD, 0, 3, &mut blocks)
        .unwrap();
    server.join().unwrap();

    let local_job = open_job(temp_dir.path());
    let mut expected = Collect::default();
    local_job
        .channel(0)
        .unwrap()
        .fetch_data(T0, T0 + 500 * PERIOD, 0, 3, &mut expected)
        .unwrap();
    assert_eq!(flatten(&blocks.0), flatten(&expected.0));
    assert_eq!(summary.values, flatten(&expected.0).len());
}

/// Tests that non-finite samples reach a remote reader unchanged.
#[test]
fn test_remote_non_finite_values() {
    let temp_dir = TempDir::new().unwrap();
    let mut values: Vec<f64> = (0..200).map(signal).collect();
    values[5] = f64::NAN;
    values[17] = f64::INFINITY;
    values[18] = f64::NEG_INFINITY;
    let mut writer = Job::new(temp_dir.path(), 1, Vec::new(), hardware(), SaverConfig::default());
    writer.sync(&[zlib_preset()]).unwrap();
    let bytes = encode_samples(&values, ByteOrder::native());
    writer.process_data(0, &bytes, T0 + 199 * PERIOD).unwrap();
    writer.finish().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let local = Directory::open(temp_dir.path(), CatalogConfig::default()).unwrap();
    let server = thread::spawn(move || {
        for stream in listener.incoming().take(3) {
            serve_connection(stream.unwrap(), &local).unwrap();
        }
    });

    let remote = Directory::connect(
        RemoteClient::new(addr.to_string(), RemoteConfig::default()),
        CatalogConfig::default(),
    );
    let mut job = remote.job(1).unwrap();
    job.fetch_channels().unwrap();
    let channel = job.channel_mut(0).unwrap();
    channel.fetch_chunks().unwrap();
    let mut blocks = Collect::default();
    channel.fetch_data(T0, Time::MAX, 0, 1, &mut blocks).unwrap();
    server.join().unwrap();

    let received = flatten(&blocks.0);
    assert_eq!(received.len(), 200);
    for (i, ((time, value), expected)) in received.iter().zip(&values).enumerate() {
        assert_eq!(*time, T0 + i as Time * PERIOD);
        assert_eq!(value.to_bits(), expected.to_bits(), "value {}", i);
    }
}
