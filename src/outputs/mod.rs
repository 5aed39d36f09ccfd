//! Report writers for finished runs.
//!
//! # Output Structure
//!
//! ```text
//! json_output_dir/
//! └── 2025-05-06/
//!     └── 6f1c…-run-id.json      # full result envelope
//!
//! markdown_output_dir/
//! └── 2025-05-06_6f1c…-run-id.md  # aggregate news summary
//! ```

pub mod json;
pub mod markdown;
