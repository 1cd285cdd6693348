/*
 * Created on Tue Mar 05 2024
 *
 * This file is a part of the htrie index engine
 * htrie is a concurrent, cache-conscious burst hash trie that indexes
 * records stored inside a single memory-mapped region, designed for
 * high read/write concurrency on many CPUs with pointer stability.
 *
 * Copyright (c) 2024, the htrie developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*!
    # Raw region access

    Everything inside the mapped region is addressed by byte offsets from the
    mapping base; these are the only places where an offset turns back into a
    pointer. All of these are unsafe: the caller asserts that the offset is
    inside the mapping and correctly aligned for `T`.
*/

use core::{ptr, slice};

/// Typed pointer at `off` bytes past `base`
#[inline(always)]
pub unsafe fn at<T>(base: *mut u8, off: u64) -> *mut T {
    debug_assert!(off != 0, "offset zero is the reserved nil reference");
    base.add(off as usize) as *mut T
}

/// Typed shared reference at `off` bytes past `base`
#[inline(always)]
pub unsafe fn aref<'a, T>(base: *mut u8, off: u64) -> &'a T {
    &*self::at::<T>(base, off)
}

/// Zero-fill `len` bytes at `off`
#[inline(always)]
pub unsafe fn zero(base: *mut u8, off: u64, len: usize) {
    ptr::write_bytes(base.add(off as usize), 0, len)
}

/// Copy `src` into the region at `off`
#[inline(always)]
pub unsafe fn copy_in(base: *mut u8, off: u64, src: &[u8]) {
    ptr::copy_nonoverlapping(src.as_ptr(), base.add(off as usize), src.len())
}

/// Borrow `len` bytes of the region at `off`
#[inline(always)]
pub unsafe fn bytes<'a>(base: *const u8, off: u64, len: usize) -> &'a [u8] {
    slice::from_raw_parts(base.add(off as usize), len)
}
