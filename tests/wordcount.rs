use itertools::Itertools;
use ruscello::prelude::*;
use ruscello::test::TestHelper;

fn lines() -> impl Iterator<Item = String> + Clone + Send {
    ["a b a", "c a b"].into_iter().map(|s| s.to_owned())
}

fn word_count(config: Config) -> Vec<(String, u64)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (sink, output) = CollectSink::new();
    let pipe = Pipe::new()
        .add(IteratorSource::new(lines()))
        .add(FlatMap::new(|line: String, coll: &mut Collector<String>| {
            for token in line.split_whitespace() {
                coll.add(token.to_owned());
            }
        }))
        .add(Map::new(|word: String| (word, 1u64)))
        .add(PReduce::<String, u64, _>::new(|a, b| a + b))
        .add(sink);
    Executor::with_config(&pipe, config).unwrap().run().unwrap();
    let mut counts = output.get().unwrap();
    counts.sort_unstable();
    counts
}

#[test]
fn word_count_counts_words() {
    let counts = word_count(Config::default());
    assert_eq!(
        counts,
        vec![
            ("a".to_owned(), 3),
            ("b".to_owned(), 2),
            ("c".to_owned(), 1)
        ]
    );
}

#[test]
fn word_count_is_parallelism_invariant() {
    let mut results = Vec::new();
    TestHelper::parallelism_sweep(&[1, 4, 16], |config| {
        results.push(word_count(config));
    });
    assert!(results.iter().all_equal());
    assert_eq!(results[0].len(), 3);
}

#[test]
fn keyed_sum_without_preceding_map() {
    // the unfused path: the key-partitioned farm gets its own emitter
    TestHelper::parallelism_sweep(&[1, 4], |config| {
        let (sink, output) = CollectSink::new();
        let pairs = (0..100u64).map(|n| (n % 7, n));
        let pipe = Pipe::new()
            .add(IteratorSource::new(pairs.clone()))
            .add(PReduce::<u64, u64, _>::new(|a, b| a + b))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();

        let mut expected = std::collections::HashMap::new();
        for (k, v) in pairs {
            *expected.entry(k).or_insert(0u64) += v;
        }
        let mut expected: Vec<_> = expected.into_iter().collect();
        expected.sort_unstable();

        let mut observed: Vec<(u64, u64)> = output.get().unwrap();
        observed.sort_unstable();
        assert_eq!(observed, expected);
    });
}

#[test]
fn keyed_sum_is_input_order_invariant() {
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let mut items: Vec<(u64, u64)> = (0..100u64).map(|n| (n % 7, n)).collect();
    let mut expected = std::collections::HashMap::new();
    for &(k, v) in &items {
        *expected.entry(k).or_insert(0u64) += v;
    }
    let mut expected: Vec<_> = expected.into_iter().collect();
    expected.sort_unstable();

    let mut rng = SmallRng::seed_from_u64(42);
    for _ in 0..3 {
        items.shuffle(&mut rng);
        let (sink, output) = CollectSink::new();
        let pipe = Pipe::new()
            .add(IteratorSource::new(items.clone().into_iter()))
            .add(PReduce::<u64, u64, _>::new(|a, b| a + b))
            .add(sink);
        Executor::with_config(&pipe, Config::default())
            .unwrap()
            .run()
            .unwrap();
        let mut observed: Vec<(u64, u64)> = output.get().unwrap();
        observed.sort_unstable();
        assert_eq!(observed, expected);
    }
}

#[test]
fn reduce_folds_the_whole_stream() {
    TestHelper::parallelism_sweep(&[1, 4, 16], |config| {
        let (sink, output) = CollectSink::<u64>::new();
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..1000u64))
            .add(Reduce::new(|a: u64, b| a + b))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        assert_eq!(output.get().unwrap(), vec![(0..1000u64).sum::<u64>()]);
    });
}

#[test]
fn map_homomorphism() {
    TestHelper::local_env(|config| {
        let (sink, output) = CollectSink::new();
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..256u32))
            .add(Map::new(|x: u32| x * 3 + 1))
            .add(sink);
        Executor::with_config(&pipe, config).unwrap().run().unwrap();
        let mut observed: Vec<u32> = output.get().unwrap();
        observed.sort_unstable();
        let expected: Vec<_> = (0..256u32).map(|x| x * 3 + 1).collect();
        assert_eq!(observed, expected);
    });
}
