use ruscello::prelude::*;
use ruscello::test::TestHelper;

#[test]
fn join_flat_map_filters_even_sums() {
    // "a": 1 + 10 = 11 is odd and filtered out, "b" has no match
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let left = Pipe::new().add(IteratorSource::new(
            [("a".to_owned(), 1i64), ("b".to_owned(), 2)].into_iter(),
        ));
        let right = Pipe::new().add(IteratorSource::new(
            std::iter::once(("a".to_owned(), 10i64)),
        ));
        let pipe = left
            .pair_with(
                right,
                JoinFlatMap::new(
                    |k: &String, v1: &i64, v2: &i64, coll: &mut Collector<(String, i64)>| {
                        let sum = v1 + v2;
                        if sum % 2 == 0 {
                            coll.add((k.clone(), sum));
                        }
                    },
                ),
            )
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        let observed: Vec<(String, i64)> = output.get().unwrap();
        assert_eq!(observed, Vec::<(String, i64)>::new());
    });
}

#[test]
fn join_flat_map_matches_keys() {
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let left = Pipe::new().add(IteratorSource::new(
            [("a".to_owned(), 1i64), ("a".to_owned(), 3), ("b".to_owned(), 2)].into_iter(),
        ));
        let right = Pipe::new().add(IteratorSource::new(
            [("a".to_owned(), 10i64), ("b".to_owned(), 5)].into_iter(),
        ));
        let pipe = left
            .pair_with(
                right,
                JoinFlatMap::new(
                    |k: &String, v1: &i64, v2: &i64, coll: &mut Collector<(String, i64)>| {
                        coll.add((k.clone(), v1 + v2));
                    },
                ),
            )
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();

        let mut observed: Vec<(String, i64)> = output.get().unwrap();
        observed.sort_unstable();
        assert_eq!(
            observed,
            vec![
                ("a".to_owned(), 11),
                ("a".to_owned(), 13),
                ("b".to_owned(), 7)
            ]
        );
    });
}

#[test]
fn origin_markers_classify_sides_of_different_types() {
    // if a batch were attributed to the wrong side the typed open would
    // panic, so a clean run proves the origin classification
    let (sink, output) = CollectSink::new();
    let left = Pipe::new().add(IteratorSource::new(
        [(1u32, "x".to_owned()), (2, "y".to_owned())].into_iter(),
    ));
    let right = Pipe::new().add(IteratorSource::new([(1u32, 100i64), (2, 200)].into_iter()));
    let pipe = left
        .pair_with(
            right,
            JoinFlatMap::new(
                |k: &u32, name: &String, value: &i64, coll: &mut Collector<String>| {
                    coll.add(format!("{k}:{name}={value}"));
                },
            ),
        )
        .add(sink);
    Executor::with_config(&pipe, Config::default())
        .unwrap()
        .run()
        .unwrap();

    let mut observed: Vec<String> = output.get().unwrap();
    observed.sort_unstable();
    assert_eq!(observed, vec!["1:x=100".to_owned(), "2:y=200".to_owned()]);
}

#[test]
fn iterated_pair_joins_every_pass_against_the_static_side() {
    let (sink, output) = CollectSink::new();
    let static_side = Pipe::new().add(IteratorSource::new(
        std::iter::once(("a".to_owned(), 2i64)),
    ));
    let body = Pipe::new().pair_with(
        static_side,
        JoinFlatMap::new(
            |k: &String, v1: &i64, v2: &i64, coll: &mut Collector<(String, i64)>| {
                coll.add((k.clone(), v1 + v2));
            },
        ),
    );
    let pipe = Pipe::new()
        .add(IteratorSource::new(std::iter::once(("a".to_owned(), 1i64))))
        .to(body.iterate(FixedIterations::new(2)))
        .add(sink);
    Executor::with_config(&pipe, Config::default())
        .unwrap()
        .run()
        .unwrap();

    // pass 1: 1 + 2 = 3, pass 2: 3 + 2 = 5
    let observed: Vec<(String, i64)> = output.get().unwrap();
    assert_eq!(observed, vec![("a".to_owned(), 5)]);
}
