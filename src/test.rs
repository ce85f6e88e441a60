//! Utilities for the integration tests of the crate.

use crate::config::Config;

/// Helper to run a test body under several engine configurations.
pub struct TestHelper;

impl TestHelper {
    /// Run the body once per parallelism degree.
    pub fn parallelism_sweep(degrees: &[usize], mut body: impl FnMut(Config)) {
        for &parallelism in degrees {
            let config = Config {
                parallelism,
                ..Config::default()
            };
            body(config);
        }
    }

    /// Run the body once per microbatch capacity.
    pub fn microbatch_sweep(capacities: &[usize], mut body: impl FnMut(Config)) {
        for &microbatch_size in capacities {
            let config = Config {
                microbatch_size,
                ..Config::default()
            };
            body(config);
        }
    }

    /// Run the body under a small grid of engine configurations.
    pub fn local_env(mut body: impl FnMut(Config)) {
        for parallelism in [1, 4] {
            for microbatch_size in [1, 512] {
                let config = Config {
                    parallelism,
                    microbatch_size,
                    ..Config::default()
                };
                body(config);
            }
        }
    }
}
