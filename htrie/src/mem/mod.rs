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

mod ll;
pub mod raw;

pub use ll::CachePadded;
