pub fn version() -> &'static str {
    // See build.rs
    env!("KUMO_CI_TAG")
}

pub fn target_triple() -> &'static str {
    // See build.rs
    env!("KUMO_TARGET_TRIPLE")
}
