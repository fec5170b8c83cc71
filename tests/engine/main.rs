#[path = "../support/mod.rs"]
mod support;

mod cleanup;
mod navigation;
