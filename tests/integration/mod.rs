//! Scenario tests for the bundled patch sets in `patches/`.

mod client_patch_sets;
