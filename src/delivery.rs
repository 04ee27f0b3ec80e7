//! Response assembly and paced delivery.

pub mod assembler;

pub use assembler::{AssembledReply, FilePayload, aggregate, deliver, extract_files, plan_deliveries, split_text};
