use crate::error::{PlayoutError, Result};
use crate::log_line::{LineId, LogLine, TransType};
use chrono::NaiveDateTime;

/// An ordered broadcast log. Positions are always `0..len` in order; line ids
/// are unique and stable across edits.
#[derive(Debug, Clone)]
pub struct Log {
    pub name: String,
    pub lines: Vec<LogLine>,
    pub modified: Option<NaiveDateTime>,
    next_id: LineId,
}

impl Log {
    pub fn new(name: &str) -> Self {
        Log {
            name: name.to_string(),
            lines: Vec::new(),
            modified: None,
            next_id: 1,
        }
    }

    /// Build a log from lines carrying their own ids. Duplicate ids are
    /// reassigned so identity stays unique.
    pub fn from_lines(name: &str, lines: Vec<LogLine>) -> Self {
        let mut log = Log::new(name);
        log.next_id = lines.iter().map(|l| l.id).max().unwrap_or(0) + 1;
        let mut seen = std::collections::HashSet::new();
        for mut line in lines {
            if !seen.insert(line.id) {
                line.id = log.alloc_id();
                seen.insert(line.id);
            }
            line.validate();
            log.lines.push(line);
        }
        log.renumber();
        log
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, line: usize) -> Option<&LogLine> {
        self.lines.get(line)
    }

    pub fn get_mut(&mut self, line: usize) -> Option<&mut LogLine> {
        self.lines.get_mut(line)
    }

    pub fn index_of(&self, id: LineId) -> Option<usize> {
        self.lines.iter().position(|l| l.id == id)
    }

    pub fn by_id(&self, id: LineId) -> Option<&LogLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    pub fn by_id_mut(&mut self, id: LineId) -> Option<&mut LogLine> {
        self.lines.iter_mut().find(|l| l.id == id)
    }

    pub fn alloc_id(&mut self) -> LineId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Make sure future ids don't collide with `id`.
    pub fn reserve_id(&mut self, id: LineId) {
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    fn check_index(&self, line: usize) -> Result<()> {
        if line >= self.lines.len() {
            return Err(PlayoutError::LineOutOfRange {
                line,
                len: self.lines.len(),
            });
        }
        Ok(())
    }

    /// Insert lines at a position, giving each a fresh id. Returns the ids.
    pub fn insert_lines(&mut self, at: usize, lines: Vec<LogLine>) -> Result<Vec<LineId>> {
        if at > self.lines.len() {
            return Err(PlayoutError::LineOutOfRange {
                line: at,
                len: self.lines.len(),
            });
        }
        let mut ids = Vec::with_capacity(lines.len());
        for (i, mut line) in lines.into_iter().enumerate() {
            line.id = self.alloc_id();
            line.runtime = Default::default();
            line.validate();
            ids.push(line.id);
            self.lines.insert(at + i, line);
        }
        self.renumber();
        Ok(ids)
    }

    /// Append lines at the end with fresh ids.
    pub fn append(&mut self, lines: Vec<LogLine>) -> Vec<LineId> {
        let at = self.lines.len();
        self.insert_lines(at, lines).unwrap_or_default()
    }

    /// Remove `count` lines starting at `line`. Returns the removed lines.
    pub fn remove_lines(&mut self, line: usize, count: usize) -> Result<Vec<LogLine>> {
        if count == 0 || count > self.lines.len().saturating_sub(line) {
            return Err(PlayoutError::LineOutOfRange {
                line: line.saturating_add(count.saturating_sub(1)),
                len: self.lines.len(),
            });
        }
        let removed = self.lines.drain(line..line + count).collect();
        self.renumber();
        Ok(removed)
    }

    pub fn remove_by_id(&mut self, id: LineId) -> Option<(usize, LogLine)> {
        let idx = self.index_of(id)?;
        let line = self.lines.remove(idx);
        self.renumber();
        Some((idx, line))
    }

    /// Move a line from one position to another.
    pub fn move_line(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_index(from)?;
        self.check_index(to)?;
        let line = self.lines.remove(from);
        self.lines.insert(to, line);
        self.renumber();
        Ok(())
    }

    /// Duplicate a line's content at `to` with a new id and transition.
    pub fn copy_line(&mut self, from: usize, to: usize, trans: TransType) -> Result<LineId> {
        self.check_index(from)?;
        let mut copy = self.lines[from].clone();
        copy.trans_type = trans;
        let ids = self.insert_lines(to, vec![copy])?;
        Ok(ids[0])
    }

    pub fn renumber(&mut self) {
        for (i, line) in self.lines.iter_mut().enumerate() {
            line.position = i;
        }
    }

    pub fn positions_contiguous(&self) -> bool {
        self.lines.iter().enumerate().all(|(i, l)| l.position == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_line::{Cart, LineStatus};

    fn make_line(id: LineId, title: &str) -> LogLine {
        LogLine::new(id, Cart::audio(id, title, "X"), TransType::Play).with_length(60_000)
    }

    fn abc() -> Log {
        Log::from_lines(
            "test",
            vec![make_line(1, "A"), make_line(2, "B"), make_line(3, "C")],
        )
    }

    fn titles(log: &Log) -> Vec<&str> {
        log.lines.iter().map(|l| l.cart.title.as_str()).collect()
    }

    #[test]
    fn new_log_is_empty() {
        let log = Log::new("Test");
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn from_lines_dedupes_ids_and_numbers_positions() {
        let log = Log::from_lines("t", vec![make_line(4, "A"), make_line(4, "B")]);
        assert_ne!(log.lines[0].id, log.lines[1].id);
        assert!(log.positions_contiguous());
        assert_eq!(log.lines[1].position, 1);
    }

    #[test]
    fn insert_assigns_fresh_ids_at_middle() {
        let mut log = abc();
        let ids = log
            .insert_lines(1, vec![make_line(1, "X"), make_line(1, "Y")])
            .unwrap();
        assert_eq!(titles(&log), vec!["A", "X", "Y", "B", "C"]);
        assert_eq!(ids, vec![4, 5]);
        assert!(log.positions_contiguous());
    }

    #[test]
    fn insert_resets_runtime() {
        let mut log = abc();
        let mut line = make_line(9, "Z");
        line.runtime.status = LineStatus::Finished;
        log.insert_lines(3, vec![line]).unwrap();
        assert_eq!(log.lines[3].status(), LineStatus::Scheduled);
    }

    #[test]
    fn insert_out_of_range_errors() {
        let mut log = abc();
        assert!(log.insert_lines(5, vec![make_line(1, "A")]).is_err());
    }

    #[test]
    fn remove_range_renumbers() {
        let mut log = abc();
        let removed = log.remove_lines(0, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(titles(&log), vec!["C"]);
        assert_eq!(log.lines[0].position, 0);
        assert!(log.remove_lines(0, 2).is_err());
        assert!(log.remove_lines(0, 0).is_err());
        assert!(log.remove_lines(usize::MAX, 2).is_err());
        assert!(log.remove_lines(1, usize::MAX).is_err());
    }

    #[test]
    fn move_keeps_ids() {
        let mut log = abc();
        log.move_line(0, 2).unwrap();
        assert_eq!(titles(&log), vec!["B", "C", "A"]);
        assert_eq!(log.index_of(1), Some(2));
        assert!(log.positions_contiguous());
        assert!(log.move_line(3, 0).is_err());
    }

    #[test]
    fn copy_overrides_transition() {
        let mut log = abc();
        let id = log.copy_line(0, 3, TransType::Segue).unwrap();
        let copy = log.by_id(id).unwrap();
        assert_eq!(copy.cart.title, "A");
        assert_eq!(copy.trans_type, TransType::Segue);
        assert_eq!(copy.position, 3);
    }

    #[test]
    fn reserve_id_skips_taken_ids() {
        let mut log = abc();
        log.reserve_id(10);
        assert_eq!(log.alloc_id(), 11);
    }
}
