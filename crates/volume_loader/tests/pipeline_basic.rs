//! Request propagation, stage contracts and build-time validation.
//!
//! Tests cover:
//! - Exact ROIs through chains of stages
//! - Request validation (unknown keys, alignment, bounds)
//! - Build errors from stage setup
//! - Merging subtrees with different voxel sizes
//! - Teardown propagation

mod common;
use common::{init_test_logging, ramp, ramp_origin, ramp_source, CountingSource};
use volume_loader::{
    stages::{Crop, DownSample, Normalize, Pad},
    Array, ArrayKey, BatchRequest, Coordinate, ErrorKind, InMemorySource, PipelineBuilder,
    PipelineError, Roi,
};

use anyhow::Result;
use std::sync::atomic::Ordering;

// ============================================================================
// 1. Propagation
// ============================================================================

#[test]
fn chain_returns_exactly_the_requested_roi() -> Result<()> {
    init_test_logging();

    let pipeline = PipelineBuilder::source(ramp_source(50))
        .then(Crop::new("raw", Roi::new([10, 10], [30, 30])))
        .then(Normalize::new("raw", 2.0))
        .build()?;

    let request = BatchRequest::new().with_array("raw", Roi::new([12, 15], [5, 7]));
    let batch = pipeline.request_batch(&request)?;
    let raw = batch.get(&"raw".into())?;

    assert_eq!(raw.roi(), &Roi::new([12, 15], [5, 7]));
    assert_eq!(raw.data.shape(), &[5, 7]);
    assert_eq!(raw.data[[0, 0]], 2.0 * (12.0 * 50.0 + 15.0));
    assert_eq!(batch.request_id(), Some(request.id()));
    Ok(())
}

#[test]
fn unrequested_keys_are_dropped() -> Result<()> {
    let labels = Array::filled(1.0, &[], Roi::new([0, 0], [50, 50]), [1, 1])?;
    let source = ramp_source(50).with_labels("labels", labels);
    let pipeline = PipelineBuilder::source(source).build()?;

    let request = BatchRequest::new().with_array("labels", Roi::new([0, 0], [5, 5]));
    let batch = pipeline.request_batch(&request)?;

    assert_eq!(batch.len(), 1);
    assert!(batch.contains(&"labels".into()));
    Ok(())
}

// ============================================================================
// 2. Request validation
// ============================================================================

#[test]
fn invalid_requests_are_rejected_before_any_read() -> Result<()> {
    let source = CountingSource::new(Roi::new([0, 0], [20, 20]));
    let reads = source.reads();
    let pipeline = PipelineBuilder::source(source).build()?;

    let unknown = BatchRequest::new().with_array("nope", Roi::new([0, 0], [4, 4]));
    let err = pipeline.request_batch(&unknown).unwrap_err();
    assert!(matches!(err, PipelineError::UnknownKey { .. }));
    assert_eq!(err.kind(), ErrorKind::Build);

    let outside = BatchRequest::new().with_array("raw", Roi::new([18, 0], [4, 4]));
    let err = pipeline.request_batch(&outside).unwrap_err();
    assert!(matches!(err, PipelineError::OutOfBounds { .. }));

    let wrong_rank = BatchRequest::new().with_array("raw", Roi::new([0], [4]));
    let err = pipeline.request_batch(&wrong_rank).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestUnsatisfiable);

    assert_eq!(reads.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn requests_must_be_aligned_to_the_voxel_grid() -> Result<()> {
    let data = Array::filled(0.0, &[], Roi::new([0, 0], [40, 40]), [4, 4])?;
    let pipeline = PipelineBuilder::source(InMemorySource::new().with_array("raw", data)).build()?;

    let misaligned = BatchRequest::new().with_array("raw", Roi::new([2, 0], [8, 8]));
    assert!(matches!(
        pipeline.validate_request(&misaligned),
        Err(PipelineError::Unsatisfiable(_))
    ));

    let aligned = BatchRequest::new().with_array("raw", Roi::new([4, 0], [8, 8]));
    pipeline.validate_request(&aligned)?;
    Ok(())
}

// ============================================================================
// 3. Build errors
// ============================================================================

#[test]
fn setup_errors_surface_from_build() {
    let missing_key = PipelineBuilder::source(ramp_source(10))
        .then(Normalize::new("labels", 1.0))
        .build();
    let err = missing_key.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert!(err.to_string().contains("labels"), "{}", err);

    // The first failure wins, later stages are never set up.
    let chained = PipelineBuilder::source(ramp_source(10))
        .then(Pad::new("missing", None))
        .then(Normalize::new("raw", 1.0))
        .build();
    assert_eq!(chained.err().map(|e| e.kind()), Some(ErrorKind::Build));
}

// ============================================================================
// 4. Merge
// ============================================================================

#[test]
fn merged_subtrees_serve_their_own_keys() -> Result<()> {
    let coarse = Array::filled(7.0, &[], Roi::new([0, 0], [100, 100]), [4, 4])?;
    let pipeline = PipelineBuilder::merge([
        PipelineBuilder::source(ramp_source(100))
            .then(DownSample::new().with_factor("raw", [2, 2], "raw_s1")),
        PipelineBuilder::source(InMemorySource::new().with_labels("labels", coarse)),
    ])
    .build()?;

    let request = BatchRequest::new()
        .with_array("raw", Roi::new([20, 20], [8, 8]))
        .with_array("raw_s1", Roi::new([20, 20], [8, 8]))
        .with_array("labels", Roi::new([20, 20], [8, 8]));
    let batch = pipeline.request_batch(&request)?;

    let raw = batch.get(&"raw".into())?;
    let raw_s1 = batch.get(&"raw_s1".into())?;
    let labels = batch.get(&"labels".into())?;

    assert_eq!(raw.data.shape(), &[8, 8]);
    assert_eq!(raw_s1.data.shape(), &[4, 4]);
    assert_eq!(raw_s1.voxel_size(), &Coordinate::new([2, 2]));
    assert_eq!(ramp_origin(raw_s1, 100), (20, 20));
    assert_eq!(labels.data.shape(), &[2, 2]);
    assert!(
        pipeline
            .spec()
            .get(&ArrayKey::new("labels"))
            .map(|s| !s.interpolatable)
            .unwrap_or(false)
    );
    Ok(())
}

// ============================================================================
// 5. Region model
// ============================================================================

#[test]
fn grow_then_shrink_is_identity() {
    let rois = [
        Roi::new([0, 0, 0], [10, 20, 30]),
        Roi::new([-5, 7, 3], [1, 1, 1]),
        Roi::new([100, -100, 0], [0, 4, 8]),
    ];
    let amounts = [
        (Coordinate::new([1, 2, 3]), Coordinate::new([0, 0, 0])),
        (Coordinate::new([4, 4, 4]), Coordinate::new([9, 1, 0])),
    ];

    for roi in &rois {
        for (a, b) in &amounts {
            assert_eq!(&roi.grow(a, b).shrink(a, b), roi);
            assert!(roi.grow(a, b).contains(roi));
        }
    }
}

// ============================================================================
// 6. Lifecycle
// ============================================================================

#[test]
fn teardown_reaches_every_source() -> Result<()> {
    let a = CountingSource::new(Roi::new([0, 0], [10, 10]));
    let a_down = a.torn_down();
    let b = InMemorySource::new().with_array("other", ramp(10));

    let mut pipeline = PipelineBuilder::merge([
        PipelineBuilder::source(a).then(Normalize::new("raw", 1.0)),
        PipelineBuilder::source(b),
    ])
    .build()?;

    assert!(!a_down.load(Ordering::SeqCst));
    pipeline.teardown();
    assert!(a_down.load(Ordering::SeqCst));
    assert!(pipeline.is_torn_down());
    Ok(())
}

#[test]
fn dropping_the_pipeline_tears_it_down() -> Result<()> {
    let source = CountingSource::new(Roi::new([0, 0], [10, 10]));
    let down = source.torn_down();

    drop(PipelineBuilder::source(source).build()?);
    assert!(down.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn logging_can_only_be_installed_once() {
    init_test_logging();
    assert!(volume_loader::logging::init_logging("info").is_err());
}
