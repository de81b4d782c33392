use tracing_subscriber::EnvFilter;

const CRATE_NAMES: &[&str] = &[
    "chunkstore",
    "chunkstore_schema",
    "chunkstore_server",
    "chunkstore_service",
    "chunkstore_types",
];

/// Installs a log subscriber writing to the captured output of the test runner.
///
/// Other crates log at `ERROR` and the chunkstore crates at `TRACE`, unless `RUST_LOG` is set.
/// Calling this more than once is fine.
///
/// ```
/// chunkstore_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives: Vec<_> = CRATE_NAMES
            .iter()
            .map(|name| format!("{name}=TRACE"))
            .collect();
        EnvFilter::new(format!("ERROR,{}", directives.join(",")))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .compact()
        .try_init();
}
