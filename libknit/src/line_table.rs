//! A sparse mapping from line numbers to values. Lines must be added in strictly ascending order,
//! which lets us store entries in fixed-size pages and find them with a binary search over the
//! pages followed by one within a page. Passes that read lines sequentially can instead use a
//! `LineCursor`, which finds each successive line in amortised constant time.

use crate::error::Result;
use anyhow::bail;

const PAGE_SIZE: usize = 64;

#[derive(Debug)]
pub struct LineTable<T> {
    pages: Vec<Page<T>>,
    len: usize,
}

#[derive(Debug)]
struct Page<T> {
    entries: Vec<(u32, T)>,
}

/// Looks up lines in ascending order.
pub struct LineCursor<'table, T> {
    table: &'table LineTable<T>,
    page: usize,
    entry: usize,
    last_requested: Option<u32>,
}

impl<T> LineTable<T> {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn last_line(&self) -> Option<u32> {
        self.pages
            .last()
            .and_then(|page| page.entries.last())
            .map(|(line, _)| *line)
    }

    /// Adds a value for `line`, which must be greater than any line previously added.
    pub fn add(&mut self, line: u32, value: T) -> Result {
        if let Some(last) = self.last_line() {
            if line <= last {
                bail!("Line {line} added to line table after line {last}");
            }
        }
        match self.pages.last_mut() {
            Some(page) if page.entries.len() < PAGE_SIZE => page.entries.push((line, value)),
            _ => {
                let mut entries = Vec::with_capacity(PAGE_SIZE);
                entries.push((line, value));
                self.pages.push(Page { entries });
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Replaces the value of a line that was previously added, returning the old value.
    pub fn replace(&mut self, line: u32, value: T) -> Result<T> {
        let Some((page, entry)) = self.position(line) else {
            bail!("Attempted to replace line {line}, which isn't in the line table");
        };
        Ok(std::mem::replace(
            &mut self.pages[page].entries[entry].1,
            value,
        ))
    }

    pub fn get(&self, line: u32) -> Option<&T> {
        self.position(line)
            .map(|(page, entry)| &self.pages[page].entries[entry].1)
    }

    pub fn cursor(&self) -> LineCursor<'_, T> {
        LineCursor {
            table: self,
            page: 0,
            entry: 0,
            last_requested: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.pages
            .iter()
            .flat_map(|page| page.entries.iter().map(|(line, value)| (*line, value)))
    }

    fn position(&self, line: u32) -> Option<(usize, usize)> {
        let page = self
            .pages
            .partition_point(|page| page.entries[0].0 <= line)
            .checked_sub(1)?;
        let entry = self.pages[page]
            .entries
            .binary_search_by_key(&line, |(line, _)| *line)
            .ok()?;
        Some((page, entry))
    }
}

impl<T> Default for LineTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'table, T> LineCursor<'table, T> {
    /// Returns the value for `line`, if any. Lines should be requested in ascending order. If a
    /// line before the previously requested line is given, we fall back to a binary search.
    pub fn get(&mut self, line: u32) -> Option<&'table T> {
        let table = self.table;
        if self.last_requested.is_some_and(|last| line < last) {
            self.last_requested = Some(line);
            let (page, entry) = table.position(line)?;
            self.page = page;
            self.entry = entry;
            return Some(&table.pages[page].entries[entry].1);
        }
        self.last_requested = Some(line);
        while let Some(page) = table.pages.get(self.page) {
            while let Some((current, value)) = page.entries.get(self.entry) {
                if *current == line {
                    return Some(value);
                }
                if *current > line {
                    return None;
                }
                self.entry += 1;
            }
            self.page += 1;
            self.entry = 0;
        }
        None
    }
}
