// ============================================================================
// Session Tests
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use codec_source::{Error as SourceError, MediaFormat, Settings};

use super::Session;
use crate::media::types::{InputMode, SessionConfig};

fn temp_output(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("recorder-{}-{}.bin", name, std::process::id()))
}

// ------------------------------------------------------------------------
// SessionConfigBuilder Tests
// ------------------------------------------------------------------------

#[test]
fn test_builder_defaults_to_pull() {
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 640, 480, 25)).build();
    assert_eq!(config.mode, InputMode::Pull);
    assert_eq!(config.frame_interval(), Duration::from_millis(40));
    assert!(config.output.is_none());
    assert!(config.frame_count.is_none());
}

#[test]
fn test_builder_surface_with_limits() {
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 640, 480, 30))
        .surface()
        .frame_count(10)
        .duration(Duration::from_secs(1))
        .stop_timeout(Duration::from_millis(500))
        .build();
    assert_eq!(config.mode, InputMode::Surface);
    assert_eq!(config.frame_count, Some(10));
    assert_eq!(config.duration, Some(Duration::from_secs(1)));
    assert_eq!(config.stop_timeout, Some(Duration::from_millis(500)));
}

// ------------------------------------------------------------------------
// Session Run Tests
// ------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pull_session_writes_every_frame() -> anyhow::Result<()> {
    let path = temp_output("pull");
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 64, 64, 200))
        .frame_size(256)
        .frame_count(10)
        .output(&path)
        .encoder(Settings {
            keyframe_interval: 5,
            ..Default::default()
        })
        .build();

    let report = Session::new(config).run().await?;
    assert_eq!(report.buffers, 10);
    assert_eq!(report.bytes, 10 * 256);
    assert_eq!(report.sync_frames, 2);
    assert_eq!(report.codec_config, 0);
    assert_eq!(report.status, SourceError::EndOfStream);
    assert_eq!(std::fs::metadata(&path)?.len(), 10 * 256);

    // payloads are written in source order
    let written = std::fs::read(&path)?;
    for (index, frame) in written.chunks(256).enumerate() {
        assert_eq!(&frame[..8], &(index as u64).to_be_bytes());
    }
    std::fs::remove_file(&path)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_surface_session_runs_for_duration() -> anyhow::Result<()> {
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 64, 64, 100))
        .surface()
        .frame_size(64)
        .duration(Duration::from_millis(150))
        .encoder(Settings {
            emit_codec_config: true,
            ..Default::default()
        })
        .build();

    let report = Session::new(config).run().await?;
    assert!(report.frames_in > 0);
    assert!(report.buffers > 0);
    assert!(report.buffers <= report.frames_in + 1);
    assert_eq!(report.status, SourceError::EndOfStream);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_surface_session_ends_after_frame_count() -> anyhow::Result<()> {
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 64, 64, 100))
        .surface()
        .frame_size(16)
        .frame_count(5)
        .build();
    assert!(config.duration.is_none());

    let report = tokio::time::timeout(Duration::from_secs(5), Session::new(config).run()).await??;
    assert_eq!(report.frames_in, 5);
    assert!(report.buffers <= 5);
    assert_eq!(report.status, SourceError::EndOfStream);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_unbounded_session() -> anyhow::Result<()> {
    let config = SessionConfig::builder(MediaFormat::video("video/avc", 64, 64, 100))
        .frame_size(32)
        .build();
    let session = Arc::new(Session::new(config));

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.cancel();
    assert!(session.is_cancelled());

    let report = tokio::time::timeout(Duration::from_secs(5), runner).await???;
    assert!(report.frames_in > 0);
    assert_eq!(report.status, SourceError::EndOfStream);
    Ok(())
}
