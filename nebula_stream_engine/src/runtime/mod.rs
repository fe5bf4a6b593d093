// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The streaming execution core: tuple buffers, memory layouts, window state, keyed
//! aggregation, joins, and executable pipeline stages.

pub mod aggregate;
pub mod buffer;
pub mod hash_map;
pub mod join;
pub mod layout;
pub mod pipeline;
pub mod slice_store;

pub use buffer::{BufferManager, TupleBuffer};
pub use layout::MemoryLayout;
