//! Tests for batches and their wire encoding.

use super::*;
use flate2::read::GzDecoder;
use std::io::Read;

fn series(name: &str, n: i64) -> TimeSeries {
    let mut ts = TimeSeries::new(name, vec![Label::new("host", "a")]);
    for i in 0..n {
        ts.push(i, i as f64);
    }
    ts
}

#[test]
fn test_batch_splits_at_capacity() {
    let mut batch = Batch::new(15);

    assert!(batch.push(series("a", 10)).is_none());
    let overflow = batch.push(series("b", 10)).unwrap();

    assert!(batch.is_full());
    assert_eq!(batch.len(), 15);
    assert_eq!(batch.series()[1].timestamps, vec![0, 1, 2, 3, 4]);
    assert_eq!(overflow.timestamps, vec![5, 6, 7, 8, 9]);
    assert_eq!(overflow.name, "b");
}

#[test]
fn test_push_into_full_batch_returns_everything() {
    let mut batch = Batch::new(5);
    assert!(batch.push(series("a", 5)).is_none());

    let overflow = batch.push(series("b", 3)).unwrap();

    assert_eq!(overflow.len(), 3);
    assert_eq!(batch.series().len(), 1);
}

#[test]
fn test_clear_resets_points() {
    let mut batch = Batch::new(10);
    batch.push(series("a", 4));
    batch.clear();
    assert!(batch.is_empty());
    assert!(batch.series().is_empty());
}

#[test]
fn test_encode_json_lines_format() {
    let mut batch = Batch::new(100);
    batch.push(series("cpu_usage", 2));

    let body = String::from_utf8(batch.encode_json_lines().unwrap()).unwrap();
    let line: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();

    assert!(body.ends_with('\n'));
    assert_eq!(line["metric"]["__name__"], "cpu_usage");
    assert_eq!(line["metric"]["host"], "a");
    assert_eq!(line["values"], serde_json::json!([0.0, 1.0]));
    assert_eq!(line["timestamps"], serde_json::json!([0, 1]));
}

#[test]
fn test_encode_drops_non_finite() {
    let mut ts = TimeSeries::new("up", vec![]);
    ts.push(1, 1.0);
    ts.push(2, f64::NAN);
    ts.push(3, f64::INFINITY);
    let mut batch = Batch::new(10);
    batch.push(ts);

    let body = batch.encode_json_lines().unwrap();
    let line: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(line["timestamps"], serde_json::json!([1]));
}

#[test]
fn test_encode_gzip() {
    let mut batch = Batch::new(100);
    batch.push(series("cpu_usage", 50));

    let plain = batch.encode(false).unwrap();
    let compressed = batch.encode(true).unwrap();

    let mut decoded = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, plain);
}

#[tokio::test]
async fn test_discard_writer_accepts() {
    let writer = create_writer(&VmConfig::default(), true);
    assert_eq!(writer.target_type(), "discard");
    assert!(writer.ping().await.is_ok());
    assert!(writer.write(&Batch::new(1)).await.is_ok());
}
