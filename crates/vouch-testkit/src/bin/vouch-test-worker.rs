//! Worker process serving a [`ScriptedVerifier`] over stdin/stdout.
//!
//! `VOUCH_TEST_AUDIENCE` pins the accepted audience.

use vouch_testkit::ScriptedVerifier;

fn main() -> anyhow::Result<()> {
    vouch::init_tracing();

    let mut verifier = ScriptedVerifier::new();
    if let Ok(audience) = std::env::var("VOUCH_TEST_AUDIENCE") {
        verifier = verifier.with_audience(audience);
    }

    vouch::run_worker(verifier)?;
    Ok(())
}
