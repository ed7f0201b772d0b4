//! Virtual terminals (spec 4.7/6), grounded on
//! `original_source/kernel/terminal.c`/`terminal.h`.

pub mod terminal;
