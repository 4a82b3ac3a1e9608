//! Background workers

pub mod log_writer;
