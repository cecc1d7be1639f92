//! Following files written by another handle

use logfan::{tail, TailEvent, TailOptions, TailStart};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;

async fn next_line(handle: &mut logfan::TailHandle) -> String {
    match tokio::time::timeout(Duration::from_secs(5), handle.next()).await {
        Ok(Some(TailEvent::Line(line))) => line,
        other => panic!("expected a line, got {:?}", other.map(|e| e.is_some())),
    }
}

fn fast(start: TailStart) -> TailOptions {
    TailOptions {
        start,
        interval: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_lines_split_across_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.log");
    let mut writer = OpenOptions::new().create(true).append(true).open(&path).unwrap();

    writer.write_all(b"ab").unwrap();
    writer.write_all(b"c\ndef\n").unwrap();
    writer.flush().unwrap();

    let mut handle = tail(&path, fast(TailStart::Skip(0)));
    assert_eq!(next_line(&mut handle).await, "abc");
    assert_eq!(next_line(&mut handle).await, "def");
    handle.closed().await;
}

#[tokio::test]
async fn test_follows_from_end() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.log");
    std::fs::write(&path, "old 1\nold 2\n").unwrap();

    let mut handle = tail(&path, fast(TailStart::End));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut writer = OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(writer, "new 1").unwrap();
    writeln!(writer, "new 2").unwrap();
    writer.flush().unwrap();

    assert_eq!(next_line(&mut handle).await, "new 1");
    assert_eq!(next_line(&mut handle).await, "new 2");
    handle.closed().await;
}

#[tokio::test]
async fn test_last_lines_then_follow() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.log");
    std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

    let mut handle = tail(&path, fast(TailStart::Last(2)));
    assert_eq!(next_line(&mut handle).await, "two");
    assert_eq!(next_line(&mut handle).await, "three");

    let mut writer = OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(writer, "four").unwrap();
    writer.flush().unwrap();
    assert_eq!(next_line(&mut handle).await, "four");

    handle.destroy();
    assert!(handle.is_destroyed());
    handle.closed().await;
}

#[tokio::test]
async fn test_idle_poll_keeps_split_character() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.log");
    let bytes = "héllo\n".as_bytes();
    std::fs::write(&path, &bytes[..2]).unwrap();

    let mut handle = tail(&path, fast(TailStart::Skip(0)));
    // the idle poll flushes the decoded fragment only
    assert_eq!(next_line(&mut handle).await, "h");

    let mut writer = OpenOptions::new().append(true).open(&path).unwrap();
    writer.write_all(&bytes[2..]).unwrap();
    writer.flush().unwrap();

    let line = next_line(&mut handle).await;
    assert_eq!(line, "éllo");
    assert!(!line.contains('\u{FFFD}'));
    handle.closed().await;
}
