//! Zucchini: differential compression/patching for executables (PE32/PE32+,
//! ELF x86/ARM32/AArch64, DEX).
//!
//! Format-aware disassembly and reference extraction feed an equivalence-map
//! builder over a suffix array of an "encoded view" (references normalized
//! away); the resulting map drives patch generation and application, with an
//! ensemble matcher handling archives of embedded executables.

#![forbid(unsafe_code)]

pub mod binary_data_histogram;
pub mod crc32;
pub mod diagnostics;
pub mod disassembler;
pub mod encoded_view;
pub mod ensemble;
pub mod equivalence_map;
pub mod label_manager;
pub mod model;
pub mod patch;
pub mod reference_bytes_mixer;
pub mod reference_holder;
pub mod region;
pub mod stream;
pub mod suffix_array;
