/*
 * Copyright 2025 iceberg-compaction
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

/// First-fit-decreasing bin packing used to cut a partition's rewrite input
/// into tasks of roughly `target_weight` bytes.
///
/// Items are sorted by weight, heaviest first, with a stable sort so equal
/// weights keep their input order. Each item goes into the first of the last
/// `lookback` bins with room, newest first, or opens a new bin. An item
/// heavier than the target gets a bin of its own. A zero target packs
/// everything into one bin.
#[derive(Debug, Clone)]
pub struct ListPacker {
    pub target_weight: u64,
    pub lookback: usize,
}

impl ListPacker {
    pub fn new(target_weight: u64) -> Self {
        Self {
            target_weight,
            lookback: 1,
        }
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback.max(1);
        self
    }

    pub fn pack<T, F>(&self, mut items: Vec<T>, weight_func: F) -> Vec<Vec<T>>
    where
        F: Fn(&T) -> u64,
    {
        items.sort_by_key(|item| std::cmp::Reverse(weight_func(item)));

        let mut bins: Vec<Bin<T>> = vec![];
        for item in items {
            let weight = weight_func(&item);
            let target_weight = self.target_weight;
            match bins
                .iter_mut()
                .rev()
                .take(self.lookback)
                .find(|bin| bin.fits(weight, target_weight))
            {
                Some(bin) => bin.push(item, weight),
                None => {
                    let mut bin = Bin::default();
                    bin.push(item, weight);
                    bins.push(bin);
                }
            }
        }
        bins.into_iter().map(|bin| bin.items).collect()
    }
}

struct Bin<T> {
    items: Vec<T>,
    weight: u64,
}

impl<T> Default for Bin<T> {
    fn default() -> Self {
        Self {
            items: vec![],
            weight: 0,
        }
    }
}

impl<T> Bin<T> {
    fn fits(&self, weight: u64, target_weight: u64) -> bool {
        target_weight == 0 || self.weight.saturating_add(weight) <= target_weight
    }

    fn push(&mut self, item: T, weight: u64) {
        self.weight = self.weight.saturating_add(weight);
        self.items.push(item);
    }
}
