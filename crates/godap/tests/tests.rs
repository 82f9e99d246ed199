// Consolidated integration test harness.
//
// Each `tests/*.rs` file becomes a separate Cargo integration test binary, so
// `godap` uses a single root file that `mod`s the rest of the suite.
mod harness;
mod suite;
