//! Integration tests for the ring collectives
//!
//! Workers are simulated in-process; these tests check that the results match
//! a direct sum or concatenation for realistic worker counts and sizes.

use shardgen::{ring_all_gather, ring_all_reduce, Tensor};

fn filled(len: usize, value: f32) -> Tensor {
    Tensor::filled(vec![len], value)
}

/// 10 workers, each holding 100 elements equal to (worker_id + 1)
/// After all-reduce every element should equal 1+2+...+10 = 55
#[test]
fn test_ring_allreduce_10_workers() {
    let n = 10;
    let partial_results: Vec<Tensor> = (0..n).map(|i| filled(100, (i + 1) as f32)).collect();

    let results = ring_all_reduce(partial_results).unwrap();

    assert_eq!(results.len(), n);
    for result in &results {
        assert_eq!(result.shape, vec![100]);
        assert!(result.data.iter().all(|&v| (v - 55.0).abs() < 1e-4));
    }
    // Every worker ends with the same tensor
    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
}

#[test]
fn test_ring_allreduce_varying_sizes() {
    for size in [1, 3, 7, 64, 1000] {
        for n in [2, 3, 5] {
            let partials: Vec<Tensor> = (0..n).map(|i| filled(size, (i + 1) as f32)).collect();
            let expected = (n * (n + 1) / 2) as f32;
            let results = ring_all_reduce(partials).unwrap();
            assert_eq!(results[0].numel(), size);
            assert!(results[n - 1].data.iter().all(|&v| (v - expected).abs() < 1e-4));
        }
    }
}

#[test]
fn test_large_tensor_allreduce() {
    let partials: Vec<Tensor> = (0..4).map(|i| filled(10_000, (i + 1) as f32)).collect();
    let results = ring_all_reduce(partials).unwrap();

    // Expected sum: 1+2+3+4 = 10
    for result in &results {
        assert_eq!(result.data[0], 10.0);
        assert_eq!(result.data[9_999], 10.0);
    }
}

#[test]
fn test_negative_and_mixed_values() {
    let partials = vec![
        Tensor::vector(vec![-5.0, 0.0, 1.5]),
        Tensor::vector(vec![3.0, 0.0, -1.5]),
        Tensor::vector(vec![-2.0, 0.0, 2.0]),
        Tensor::vector(vec![10.0, 0.0, 0.0]),
    ];
    let results = ring_all_reduce(partials).unwrap();
    assert_eq!(results[2].data, vec![6.0, 0.0, 2.0]);
}

#[test]
fn test_numerical_precision() {
    let partials: Vec<Tensor> = (1..=5).map(|i| filled(16, i as f32 * 1e-7)).collect();
    let results = ring_all_reduce(partials).unwrap();
    assert!(results[0].data.iter().all(|&v| (v - 15e-7).abs() < 1e-10));
}

#[test]
fn test_allreduce_keeps_matrix_shape() {
    let partials: Vec<Tensor> = (0..3)
        .map(|i| Tensor::new((0..6).map(|j| (i * 6 + j) as f32).collect(), vec![2, 3]).unwrap())
        .collect();
    let results = ring_all_reduce(partials).unwrap();
    assert_eq!(results[1].shape, vec![2, 3]);
    assert_eq!(results[1].data, vec![18.0, 21.0, 24.0, 27.0, 30.0, 33.0]);
}

#[test]
fn test_all_gather_reassembles_columns() {
    let full = Tensor::new((0..24).map(|v| v as f32).collect(), vec![3, 8]).unwrap();
    let blocks: Vec<Tensor> = (0..4)
        .map(|i| full.slice_axis(1, i * 2, i * 2 + 2).unwrap())
        .collect();

    let gathered = ring_all_gather(blocks, 1).unwrap();
    assert_eq!(gathered.len(), 4);
    for tensor in gathered {
        assert_eq!(tensor, full);
    }
}

#[test]
fn test_all_gather_uneven_rows() {
    let full = Tensor::new((0..10).map(|v| v as f32).collect(), vec![5, 2]).unwrap();
    // Remainder on the last block
    let blocks = vec![
        full.slice_axis(0, 0, 1).unwrap(),
        full.slice_axis(0, 1, 2).unwrap(),
        full.slice_axis(0, 2, 5).unwrap(),
    ];
    let gathered = ring_all_gather(blocks, 0).unwrap();
    assert!(gathered.iter().all(|t| t == &full));
}
