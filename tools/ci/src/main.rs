use xshell::{cmd, Shell};

// Adapted from the Bevy CI pipeline

fn main() {
    // Local runs use whatever the default Rust toolchain is
    let sh = Shell::new().expect("Couldn't create new xshell Shell environment");

    // See if any code needs to be formatted
    cmd!(sh, "cargo fmt --all -- --check")
        .run()
        .expect("Please run 'cargo fmt --all' to format your code.");

    // See if clippy has any complaints.
    cmd!(sh, "cargo clippy --package raconteur --all-targets --all-features -- -D warnings -W clippy::doc_markdown")
        .run()
        .expect("Please fix clippy errors in output above.");

    sh.set_var("RUSTDOCFLAGS", "-D warnings");
    // Check the documentation format is valid
    cmd!(sh, "cargo doc --package raconteur --no-deps")
        .run()
        .expect("Please check that all documentation follows rustdoc standards");

    // Pass `nonlocal` to skip the test run when CI runs it separately
    let args: Vec<String> = std::env::args().collect();
    if args.get(1) != Some(&"nonlocal".to_string()) {
        // Local transport tests share run directories, so run them one at a time
        cmd!(sh, "cargo test --workspace -- --nocapture --test-threads=1")
            .run()
            .expect("Please fix failing tests in output above.");

        cmd!(sh, "cargo test --doc --workspace")
            .run()
            .expect("Please fix failing doc-tests in output above.");
    }
}
