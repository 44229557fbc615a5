use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::db::AnalysisDb;
use crate::model::{
    Flags, FunctionInfo, Insn, InsnKind, ItemKind, SegmentClass, SegmentInfo, XrefKind,
};
use crate::services::backends::InstructionDecoder;

/// Longest instruction the decoder is ever handed.
const MAX_INSN_LEN: usize = 16;

/// A loaded segment and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub class: SegmentClass,
    pub start: u64,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn new(name: impl Into<String>, class: SegmentClass, start: u64, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), class, start, bytes }
    }

    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    fn contains(&self, ea: u64) -> bool {
        ea >= self.start && ea < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemData {
    Code,
    Data { element_size: u64, offset: bool },
    Alignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    size: u64,
    data: ItemData,
}

impl Item {
    fn kind(&self) -> ItemKind {
        match self.data {
            ItemData::Code => ItemKind::Code,
            ItemData::Data { .. } => ItemKind::Data,
            ItemData::Alignment => ItemKind::Alignment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FunctionEntry {
    end: u64,
    no_return: bool,
}

/// Background work queued by mutations and drained by `wait_idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Code(u64),
    Function(u64),
}

/// Bidirectional xref index.
#[derive(Debug, Default)]
struct XrefIndex {
    from: BTreeSet<(u64, u64)>,
    to: BTreeSet<(u64, u64)>,
}

impl XrefIndex {
    fn add(&mut self, from: u64, to: u64) {
        self.from.insert((from, to));
        self.to.insert((to, from));
    }

    fn first_from(&self, ea: u64) -> Option<u64> {
        self.from.range((ea, 0)..=(ea, u64::MAX)).next().map(|&(_, to)| to)
    }

    fn first_to(&self, ea: u64) -> Option<u64> {
        self.to.range((ea, 0)..=(ea, u64::MAX)).next().map(|&(_, from)| from)
    }

    fn remove_from_range(&mut self, start: u64, end: u64) {
        let doomed: Vec<(u64, u64)> = self.from.range((start, 0)..(end, 0)).copied().collect();
        for (from, to) in doomed {
            self.from.remove(&(from, to));
            self.to.remove(&(to, from));
        }
    }
}

/// In-memory analysis database.
///
/// Bytes not covered by an item are single-byte unknown heads. Creating
/// instructions queues follow-up work (fallthrough, jump and call targets) the
/// way a host's auto-analysis would; nothing happens until `wait_idle`.
pub struct MemoryDb {
    segments: Vec<Segment>,
    items: BTreeMap<u64, Item>,
    functions: BTreeMap<u64, FunctionEntry>,
    names: BTreeMap<u64, String>,
    crefs: XrefIndex,
    drefs: XrefIndex,
    pending: VecDeque<Task>,
    decoder: Box<dyn InstructionDecoder>,
}

impl fmt::Debug for MemoryDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDb")
            .field("segments", &self.segments.len())
            .field("items", &self.items.len())
            .field("functions", &self.functions.len())
            .field("pending", &self.pending.len())
            .field("decoder", &self.decoder.name())
            .finish()
    }
}

impl MemoryDb {
    pub fn new(decoder: Box<dyn InstructionDecoder>) -> Self {
        Self {
            segments: Vec::new(),
            items: BTreeMap::new(),
            functions: BTreeMap::new(),
            names: BTreeMap::new(),
            crefs: XrefIndex::default(),
            drefs: XrefIndex::default(),
            pending: VecDeque::new(),
            decoder,
        }
    }

    /// Add a segment; segments are kept sorted and must not overlap.
    pub fn add_segment(&mut self, segment: Segment) {
        let pos = self.segments.partition_point(|s| s.start < segment.start);
        self.segments.insert(pos, segment);
    }

    /// Define a data item of `len` bytes, optionally tagged as an offset.
    pub fn make_data(&mut self, ea: u64, len: u64, offset: bool) -> bool {
        if len == 0 || !self.range_is_unknown(ea, ea + len) {
            return false;
        }
        let data = ItemData::Data { element_size: len, offset };
        self.items.insert(ea, Item { size: len, data });
        true
    }

    pub fn add_xref(&mut self, from: u64, to: u64, kind: XrefKind) {
        match kind {
            XrefKind::Code => self.crefs.add(from, to),
            XrefKind::Data => self.drefs.add(from, to),
        }
    }

    pub fn set_name(&mut self, ea: u64, name: impl Into<String>) {
        self.names.insert(ea, name.into());
    }

    /// Toggle the no-return attribute of the function starting at `start`.
    pub fn set_no_return(&mut self, start: u64, no_return: bool) -> bool {
        match self.functions.get_mut(&start) {
            Some(func) => {
                func.no_return = no_return;
                true
            }
            None => false,
        }
    }

    /// Element size of the data item starting at `ea`.
    pub fn data_element_size(&self, ea: u64) -> Option<u64> {
        match self.items.get(&ea)?.data {
            ItemData::Data { element_size, .. } => Some(element_size),
            _ => None,
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    fn segment_of(&self, ea: u64) -> Option<&Segment> {
        let pos = self.segments.partition_point(|s| s.start <= ea);
        pos.checked_sub(1).map(|i| &self.segments[i]).filter(|s| s.contains(ea))
    }

    fn is_loaded(&self, ea: u64) -> bool {
        self.segment_of(ea).is_some()
    }

    fn item_containing(&self, ea: u64) -> Option<(u64, Item)> {
        self.items
            .range(..=ea)
            .next_back()
            .filter(|(&head, item)| head + item.size > ea)
            .map(|(&head, &item)| (head, item))
    }

    fn is_unknown_at(&self, ea: u64) -> bool {
        self.is_loaded(ea) && self.item_containing(ea).is_none()
    }

    fn is_code_head(&self, ea: u64) -> bool {
        matches!(self.items.get(&ea), Some(Item { data: ItemData::Code, .. }))
    }

    /// `[start, end)` lies inside one segment and no item overlaps it.
    fn range_is_unknown(&self, start: u64, end: u64) -> bool {
        let Some(seg) = self.segment_of(start) else {
            return false;
        };
        if end <= start || end > seg.end() {
            return false;
        }
        match self.items.range(..end).next_back() {
            Some((&head, item)) => head + item.size <= start,
            None => true,
        }
    }

    fn has_xref_to(&self, ea: u64) -> bool {
        self.crefs.first_to(ea).is_some() || self.drefs.first_to(ea).is_some()
    }

    fn calls_no_return(&self, insn: &Insn) -> bool {
        if insn.kind != InsnKind::Call {
            return false;
        }
        let target = insn.target.or_else(|| self.crefs.first_from(insn.address));
        target.and_then(|t| self.functions.get(&t)).is_some_and(|f| f.no_return)
    }

    fn record_insn_refs(&mut self, insn: &Insn) {
        if let Some(target) = insn.target.filter(|&t| self.is_loaded(t)) {
            self.crefs.add(insn.address, target);
            match insn.kind {
                InsnKind::Call => self.pending.push_back(Task::Function(target)),
                InsnKind::Jump | InsnKind::ConditionalJump => {
                    self.pending.push_back(Task::Code(target))
                }
                _ => {}
            }
        }
        if let Some(mem) = insn.mem_ref.filter(|&m| self.is_loaded(m)) {
            match insn.kind {
                // Indirect through a pointer slot, e.g. an import thunk.
                InsnKind::Call | InsnKind::Jump => self.crefs.add(insn.address, mem),
                _ => self.drefs.add(insn.address, mem),
            }
        }
        if !insn.kind.stops_flow() && !self.calls_no_return(insn) {
            self.pending.push_back(Task::Code(insn.end()));
        }
    }
}

impl AnalysisDb for MemoryDb {
    fn segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .iter()
            .map(|s| SegmentInfo {
                name: s.name.clone(),
                class: s.class,
                start: s.start,
                end: s.end(),
            })
            .collect()
    }

    fn flags(&self, ea: u64) -> Flags {
        let Some(value) = self.byte(ea) else {
            return Flags::default();
        };
        match self.item_containing(ea) {
            Some((head, item)) => {
                let is_head = head == ea;
                Flags {
                    value: Some(value),
                    kind: item.kind(),
                    is_head,
                    has_xref: is_head && self.has_xref_to(ea),
                    is_offset: is_head
                        && matches!(item.data, ItemData::Data { offset: true, .. }),
                }
            }
            None => Flags {
                value: Some(value),
                kind: ItemKind::Unknown,
                is_head: true,
                has_xref: self.has_xref_to(ea),
                is_offset: false,
            },
        }
    }

    fn byte(&self, ea: u64) -> Option<u8> {
        let seg = self.segment_of(ea)?;
        seg.bytes.get((ea - seg.start) as usize).copied()
    }

    fn item_size(&self, ea: u64) -> u64 {
        match self.item_containing(ea) {
            Some((head, item)) => head + item.size - ea,
            None => 1,
        }
    }

    fn is_byte_array(&self, ea: u64) -> bool {
        self.data_element_size(ea) == Some(1)
    }

    fn next_head(&self, ea: u64, limit: u64) -> Option<u64> {
        let mut addr = ea.checked_add(1)?;
        while addr < limit {
            if !self.is_loaded(addr) {
                addr = self.segments.iter().map(|s| s.start).find(|&s| s > addr)?;
                continue;
            }
            match self.item_containing(addr) {
                Some((head, item)) if head < addr => addr = head + item.size,
                _ => return Some(addr),
            }
        }
        None
    }

    fn prev_head(&self, ea: u64, floor: u64) -> Option<u64> {
        let mut addr = ea.checked_sub(1)?;
        loop {
            if addr < floor {
                return None;
            }
            if !self.is_loaded(addr) {
                let end = self.segments.iter().rev().map(Segment::end).find(|&e| e <= addr)?;
                addr = end.checked_sub(1)?;
                continue;
            }
            let head = self.item_containing(addr).map_or(addr, |(head, _)| head);
            return (head >= floor).then_some(head);
        }
    }

    fn decode(&self, ea: u64) -> Option<Insn> {
        let seg = self.segment_of(ea)?;
        let offset = (ea - seg.start) as usize;
        let window = &seg.bytes[offset..(offset + MAX_INSN_LEN).min(seg.bytes.len())];
        self.decoder.decode(window, ea).filter(|insn| insn.size > 0 && insn.end() <= seg.end())
    }

    fn first_cref_from(&self, ea: u64) -> Option<u64> {
        self.crefs.first_from(ea)
    }

    fn first_cref_to(&self, ea: u64) -> Option<u64> {
        self.crefs.first_to(ea)
    }

    fn first_dref_from(&self, ea: u64) -> Option<u64> {
        self.drefs.first_from(ea)
    }

    fn first_dref_to(&self, ea: u64) -> Option<u64> {
        self.drefs.first_to(ea)
    }

    fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn function_by_index(&self, index: usize) -> Option<FunctionInfo> {
        self.functions.iter().nth(index).map(|(&start, f)| FunctionInfo {
            start,
            end: f.end,
            no_return: f.no_return,
        })
    }

    fn function_chunk(&self, ea: u64) -> Option<FunctionInfo> {
        self.functions
            .range(..=ea)
            .next_back()
            .filter(|(_, f)| f.end > ea)
            .map(|(&start, f)| FunctionInfo { start, end: f.end, no_return: f.no_return })
    }

    fn name_at(&self, ea: u64) -> Option<String> {
        self.names
            .get(&ea)
            .cloned()
            .or_else(|| self.functions.contains_key(&ea).then(|| format!("sub_{ea:X}")))
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn make_unknown(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let mut doomed: Vec<u64> = self.items.range(start..end).map(|(&head, _)| head).collect();
        if let Some((head, _)) = self.item_containing(start).filter(|&(head, _)| head < start) {
            doomed.push(head);
        }
        for head in doomed {
            let Some(item) = self.items.remove(&head) else {
                continue;
            };
            let item_end = head + item.size;
            self.crefs.remove_from_range(head, item_end);
            self.drefs.remove_from_range(head, item_end);
            if item.data != ItemData::Code || self.functions.remove(&head).is_some() {
                continue;
            }
            // A function losing a body instruction ends right before it.
            if let Some((_, func)) = self.functions.range_mut(..head).next_back() {
                if func.end > head {
                    func.end = head;
                }
            }
        }
    }

    fn make_align(&mut self, ea: u64, len: u64) -> bool {
        if len == 0 || !self.range_is_unknown(ea, ea + len) {
            return false;
        }
        self.items.insert(ea, Item { size: len, data: ItemData::Alignment });
        true
    }

    fn make_byte_array(&mut self, ea: u64, len: u64) -> bool {
        if len == 0 || !self.range_is_unknown(ea, ea + len) {
            return false;
        }
        self.items
            .insert(ea, Item { size: len, data: ItemData::Data { element_size: 1, offset: false } });
        true
    }

    fn create_insn(&mut self, ea: u64) -> Option<u64> {
        let insn = self.decode(ea)?;
        if !self.range_is_unknown(ea, insn.end()) {
            return None;
        }
        self.items.insert(ea, Item { size: insn.size, data: ItemData::Code });
        self.record_insn_refs(&insn);
        Some(insn.size)
    }

    fn add_function(&mut self, start: u64) -> bool {
        if self.function_chunk(start).is_some() {
            return false;
        }
        if self.is_unknown_at(start) && self.create_insn(start).is_none() {
            return false;
        }
        if !self.is_code_head(start) {
            return false;
        }
        let Some(seg_end) = self.segment_of(start).map(Segment::end) else {
            return false;
        };

        let mut addr = start;
        let mut end = start;
        let mut saw_return = false;
        let mut ends_in_no_return_call = false;
        while addr < seg_end {
            if addr != start && self.function_chunk(addr).is_some() {
                break;
            }
            if self.is_unknown_at(addr) && self.create_insn(addr).is_none() {
                break;
            }
            if !self.is_code_head(addr) {
                break;
            }
            let Some(insn) = self.decode(addr) else {
                break;
            };
            end = insn.end();
            saw_return |= insn.kind.is_return();
            if insn.kind.stops_flow() {
                break;
            }
            if self.calls_no_return(&insn) {
                ends_in_no_return_call = true;
                break;
            }
            addr = end;
        }
        if end == start {
            return false;
        }

        let no_return = !saw_return && ends_in_no_return_call;
        self.functions.insert(start, FunctionEntry { end, no_return });
        true
    }

    fn wait_idle(&mut self) {
        while let Some(task) = self.pending.pop_front() {
            match task {
                Task::Code(ea) => {
                    if self.is_unknown_at(ea) {
                        self.create_insn(ea);
                    }
                }
                Task::Function(ea) => {
                    if self.function_chunk(ea).is_none() {
                        self.add_function(ea);
                    }
                }
            }
        }
    }
}
