// Single integration test binary; each module covers one area through the public API.

mod common;
mod connection_test;
mod consumer_test;
mod durability_test;
mod queue_admin_test;
