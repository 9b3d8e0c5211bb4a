/// Installs the logger used by tests. Output is captured by the test harness
/// and only shown for failing tests.
pub fn test_logger() {
    if cfg!(not(feature = "tstore_miri")) {
        // Tests run in parallel, so the logger may already be installed.
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
