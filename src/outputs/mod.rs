//! Writing digests to disk.
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! ├── 2025-05-06/
//! │   ├── alice_0800.json
//! │   ├── alice_1400.json
//! │   └── bob_1800.json
//! ```

pub mod json;
