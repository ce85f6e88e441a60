use ruscello::prelude::*;
use ruscello::test::TestHelper;

#[test]
fn fixed_iterations_duplicate() {
    // a flat-map duplicating every pair, looped three times: 1 -> 2^3
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let duplicate = Pipe::new().add(FlatMap::new(
            |pair: (String, i32), coll: &mut Collector<(String, i32)>| {
                coll.add(pair.clone());
                coll.add(pair);
            },
        ));
        let pipe = Pipe::new()
            .add(IteratorSource::new(std::iter::once(("a".to_owned(), 1i32))))
            .to(duplicate.iterate(FixedIterations::new(3)))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();

        let observed: Vec<(String, i32)> = output.get().unwrap();
        assert_eq!(observed.len(), 8);
        assert!(observed.iter().all(|(k, v)| k == "a" && *v == 1));
    });
}

#[test]
fn iteration_equivalence_with_sequential_applications() {
    // n passes of a pure map equal n sequential applications of it
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let body = Pipe::new().add(Map::new(|x: i64| x * 2 + 1));
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..64i64))
            .to(body.iterate(FixedIterations::new(4)))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();

        let mut observed: Vec<i64> = output.get().unwrap();
        observed.sort_unstable();
        let mut expected: Vec<i64> = (0..64i64)
            .map(|mut x| {
                for _ in 0..4 {
                    x = x * 2 + 1;
                }
                x
            })
            .collect();
        expected.sort_unstable();
        assert_eq!(observed, expected);
    });
}

#[test]
fn single_iteration_is_one_application() {
    let (sink, output) = CollectSink::new();
    let body = Pipe::new().add(Map::new(|x: i64| x + 10));
    let pipe = Pipe::new()
        .add(IteratorSource::new(0..16i64))
        .to(body.iterate(FixedIterations::new(1)))
        .add(sink);
    Executor::with_config(&pipe, Config::default())
        .unwrap()
        .run()
        .unwrap();

    let mut observed: Vec<i64> = output.get().unwrap();
    observed.sort_unstable();
    assert_eq!(observed, (10..26i64).collect::<Vec<_>>());
}

#[test]
fn iteration_with_keyed_reduce_in_the_body() {
    // per-pass tags isolate the reducer state between passes
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let body = Pipe::new()
            .add(FlatMap::new(
                |(k, v): (u32, u64), coll: &mut Collector<(u32, u64)>| {
                    coll.add((k, v));
                    coll.add((k, 1));
                },
            ))
            .add(PReduce::<u32, u64, _>::new(|a, b| a + b));
        let pipe = Pipe::new()
            .add(IteratorSource::new([(0u32, 0u64), (1, 10)].into_iter()))
            .to(body.iterate(FixedIterations::new(3)))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();

        // each pass folds (k, v) and (k, 1) into (k, v + 1)
        let mut observed: Vec<(u32, u64)> = output.get().unwrap();
        observed.sort_unstable();
        assert_eq!(observed, vec![(0, 3), (1, 13)]);
    });
}
