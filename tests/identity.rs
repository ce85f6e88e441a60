use std::io::Write;

use itertools::Itertools;
use ruscello::prelude::*;
use ruscello::test::TestHelper;

#[test]
fn identity_preserves_the_multiset() {
    TestHelper::local_env(|config| {
        let (sink, output) = CollectSink::new();
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..500u32))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        let mut observed: Vec<u32> = output.get().unwrap();
        observed.sort_unstable();
        assert_eq!(observed, (0..500u32).collect::<Vec<_>>());
    });
}

#[test]
fn ordered_flow_preserves_order_through_a_parallel_map() {
    // round-robin farms compose per-worker FIFO into a global FIFO
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let pipe = Pipe::new()
            .add(IteratorSource::ordered(0..500u32))
            .add(Map::new(|x: u32| x + 1))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        // no sorting: the order must already match
        let observed: Vec<u32> = output.get().unwrap();
        assert_eq!(observed, (1..=500u32).collect::<Vec<_>>());
    });
}

#[test]
fn microbatch_capacity_does_not_change_the_output() {
    let mut results = Vec::new();
    TestHelper::microbatch_sweep(&[1, 1024], |config| {
        let (sink, output) = CollectSink::new();
        let pipe = Pipe::new()
            .add(IteratorSource::new((0..300u32).map(|x| x.to_string())))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        let mut observed: Vec<String> = output.get().unwrap();
        observed.sort_unstable();
        results.push(observed);
    });
    assert!(results.iter().all_equal());
    assert_eq!(results[0].len(), 300);
}

#[test]
fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("input.txt");
    let output_path = dir.path().join("output.txt");

    let lines: Vec<String> = (0..100).map(|n| format!("line {n}")).collect();
    let mut input = std::fs::File::create(&input_path).unwrap();
    for line in &lines {
        writeln!(input, "{line}").unwrap();
    }
    drop(input);

    let pipe = Pipe::new()
        .add(FileSource::new(&input_path))
        .add(FileSink::new(&output_path, |line: &String| line.clone()));
    Executor::with_config(&pipe, Config::default())
        .unwrap()
        .run()
        .unwrap();

    let mut observed: Vec<String> = std::fs::read_to_string(&output_path)
        .unwrap()
        .lines()
        .map(|s| s.to_owned())
        .collect();
    observed.sort_unstable();
    let mut expected = lines;
    expected.sort_unstable();
    assert_eq!(observed, expected);
}
