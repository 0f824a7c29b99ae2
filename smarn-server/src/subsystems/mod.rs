pub mod capture_loop;
pub mod embedder;
pub mod retrieve;
