//! # Physical and Virtual Addresses
//!
//! Newtypes that keep bus addresses and translated addresses apart, plus the
//! frame type the physical allocator hands out.
//!
//! A [`PhysicalPage<Size4K>`] is a *frame*. Frames are numbered by their
//! page-frame number (`address >> 12`), which is how the allocator indexes
//! its descriptor table:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let frame = PhysicalAddress::new(0x42_345).page::<Size4K>();
//! assert_eq!(frame.pfn(), 0x42);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x42_000));
//! assert_eq!(PhysicalPage::from_pfn(0x42), frame);
//! ```
//!
//! Virtual addresses split into a user half below `0x0000_8000_0000_0000` and
//! a kernel half from `0xFFFF_8000_0000_0000`; everything between is
//! non-canonical and never mapped.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use crate::page_size::{PageSize, Size1G, Size2M, Size4K};
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
