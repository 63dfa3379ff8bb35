//! `sandcastle-worker`: the process that runs the job queue.

pub mod app;
