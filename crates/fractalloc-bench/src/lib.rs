//! Benchmark-only member; see `benches/alloc_bench.rs`.
