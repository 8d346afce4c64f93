//! Edit model: components, validation and the internal step form.
//!
//! Positions and lengths count `char`s. A component's position is relative to
//! the text after every earlier component of the same edit has been applied:
//!
//! ```text
//! base  "hello"      Insert(0, ">> ")   Delete(3, 5)    Insert(3, "bye")
//!                    ">> hello"         ">> "           ">> bye"
//! ```
//!
//! Positions never move backwards, but a component may land inside text an
//! earlier component of the same edit inserted. Two deletes of the same
//! base chars cannot be expressed.
//!
//! The algebra never works on components directly. It lowers an edit into a
//! dense list of [`Step`]s that spans the whole base text (gaps become
//! retains) and builds its results back from steps, which yields the
//! canonical positional form.

use serde::{Deserialize, Serialize};

use crate::algebra::compose_steps;
use crate::error::{OtError, Result};

/// One atomic piece of an [`Edit`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// Insert `text` at `position`.
    Insert {
        /// Char offset into the text left by earlier components
        position: usize,
        text: String,
    },
    /// Remove `length` chars starting at `position`.
    Delete {
        /// Char offset into the text left by earlier components
        position: usize,
        /// Chars removed
        length: usize,
    },
    /// Move the cursor over `count` unchanged chars.
    Retain {
        /// Chars skipped from where the previous component left off
        count: usize,
    },
}

impl Component {
    /// Whether this component leaves the text untouched.
    pub fn is_noop(&self) -> bool {
        match self {
            Component::Insert { text, .. } => text.is_empty(),
            Component::Delete { length, .. } => *length == 0,
            Component::Retain { .. } => true,
        }
    }
}

/// An indivisible change to a text of `base_len` chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edit {
    /// Chars in the text this edit applies to
    base_len: usize,
    /// In order of non-decreasing position
    components: Vec<Component>,
}

impl Edit {
    /// The edit that changes nothing.
    pub fn identity(base_len: usize) -> Self {
        Self {
            base_len,
            components: Vec::new(),
        }
    }

    /// Build an edit from components, rejecting out-of-order or overrunning
    /// components with [`OtError::MalformedEdit`].
    pub fn new(base_len: usize, components: Vec<Component>) -> Result<Self> {
        let edit = Self {
            base_len,
            components,
        };
        edit.steps()?;
        Ok(edit)
    }

    /// Insert `text` at `position` of a `base_len`-char text.
    pub fn insert(base_len: usize, position: usize, text: impl Into<String>) -> Result<Self> {
        Self::new(
            base_len,
            vec![Component::Insert {
                position,
                text: text.into(),
            }],
        )
    }

    /// Remove `length` chars at `position` of a `base_len`-char text.
    pub fn delete(base_len: usize, position: usize, length: usize) -> Result<Self> {
        Self::new(base_len, vec![Component::Delete { position, length }])
    }

    /// Delete `length` chars at `position` and put `text` in their place.
    pub fn replace(
        base_len: usize,
        position: usize,
        length: usize,
        text: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            base_len,
            vec![
                Component::Delete { position, length },
                Component::Insert {
                    position,
                    text: text.into(),
                },
            ],
        )
    }

    /// Length of the text this edit was computed against.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the text after applying this edit.
    pub fn target_len(&self) -> usize {
        let mut len = self.base_len;
        for component in &self.components {
            match component {
                Component::Insert { text, .. } => len = len.saturating_add(text.chars().count()),
                Component::Delete { length, .. } => len = len.saturating_sub(*length),
                Component::Retain { .. } => {}
            }
        }
        len
    }

    /// The components as given, or in canonical positional form for edits
    /// produced by the algebra.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Whether applying the edit changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(Component::is_noop)
    }

    /// Lower into a dense step list covering exactly `base_len` chars.
    pub(crate) fn steps(&self) -> Result<Vec<Step>> {
        let mut lowering = Lowering::new(self.base_len);
        for (index, component) in self.components.iter().enumerate() {
            lowering.push(index, component)?;
        }
        Ok(lowering.steps)
    }

    /// Rebuild the canonical positional form from dense steps.
    pub(crate) fn from_steps(base_len: usize, steps: Vec<Step>) -> Self {
        let mut components = Vec::with_capacity(steps.len());
        let mut cursor = 0;
        for step in steps {
            match step {
                Step::Retain(n) => cursor += n,
                Step::Insert(text) => {
                    let len = text.chars().count();
                    components.push(Component::Insert {
                        position: cursor,
                        text,
                    });
                    cursor += len;
                }
                Step::Delete(n) => components.push(Component::Delete {
                    position: cursor,
                    length: n,
                }),
            }
        }
        Self {
            base_len,
            components,
        }
    }
}

/// Folds components one at a time into the steps taking the base text to
/// the partially applied text.
struct Lowering {
    /// Base text to partially applied text.
    steps: Vec<Step>,
    /// Length of the partially applied text.
    len: usize,
    /// Position of the previous component. Later ones may not start before it.
    floor: usize,
    /// Where a `Retain` starts counting.
    cursor: usize,
}

impl Lowering {
    fn new(base_len: usize) -> Self {
        let mut identity = StepBuilder::default();
        identity.retain(base_len);
        Self {
            steps: identity.finish(),
            len: base_len,
            floor: 0,
            cursor: 0,
        }
    }

    fn push(&mut self, index: usize, component: &Component) -> Result<()> {
        match component {
            Component::Retain { count } => {
                self.cursor = self.span_end(self.cursor, *count, index)?;
                self.floor = self.cursor;
            }
            Component::Insert { position, text } => {
                let position = self.check_position(*position, index)?;
                let added = text.chars().count();
                let len = self
                    .len
                    .checked_add(added)
                    .ok_or_else(|| self.overrun(index))?;

                let mut single = StepBuilder::default();
                single.retain(position);
                single.insert(text);
                single.retain(self.len - position);
                self.fold_in(single, index)?;

                self.len = len;
                self.floor = position;
                self.cursor = position + added;
            }
            Component::Delete { position, length } => {
                let position = self.check_position(*position, index)?;
                let end = self.span_end(position, *length, index)?;

                let mut single = StepBuilder::default();
                single.retain(position);
                single.delete(*length);
                single.retain(self.len - end);
                self.fold_in(single, index)?;

                self.len -= *length;
                self.floor = position;
                self.cursor = position;
            }
        }
        Ok(())
    }

    /// Positions may repeat or land inside text inserted earlier in the
    /// edit, but never move backwards.
    fn check_position(&self, position: usize, index: usize) -> Result<usize> {
        if position < self.floor {
            return Err(OtError::malformed(format!(
                "component {index} at position {position} comes before position {}",
                self.floor
            )));
        }
        if position > self.len {
            return Err(self.overrun(index));
        }
        Ok(position)
    }

    /// End of `n` chars from `start`, if they fit in the partially applied text.
    fn span_end(&self, start: usize, n: usize, index: usize) -> Result<usize> {
        start
            .checked_add(n)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| self.overrun(index))
    }

    fn overrun(&self, index: usize) -> OtError {
        OtError::malformed(format!(
            "component {index} runs past the end of a {}-char text",
            self.len
        ))
    }

    fn fold_in(&mut self, single: StepBuilder, index: usize) -> Result<()> {
        let steps = std::mem::take(&mut self.steps);
        self.steps = compose_steps(steps, single.finish()).ok_or_else(|| {
            OtError::malformed(format!("component {index} does not line up with the text"))
        })?;
        Ok(())
    }
}

/// Dense, length-based form used by the algebra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// Accumulates steps, merging neighbours of the same kind and keeping an
/// insert ahead of a delete at the same position.
#[derive(Debug, Default)]
pub(crate) struct StepBuilder {
    steps: Vec<Step>,
}

impl StepBuilder {
    pub(crate) fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        match self.steps.last_mut() {
            Some(Step::Retain(m)) => *m += n,
            _ => self.steps.push(Step::Retain(n)),
        }
    }

    pub(crate) fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        match self.steps.last_mut() {
            Some(Step::Delete(m)) => *m += n,
            _ => self.steps.push(Step::Delete(n)),
        }
    }

    pub(crate) fn insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let len = self.steps.len();
        match self.steps.last_mut() {
            Some(Step::Insert(existing)) => existing.push_str(text),
            Some(Step::Delete(_)) => {
                if len >= 2 {
                    if let Step::Insert(existing) = &mut self.steps[len - 2] {
                        existing.push_str(text);
                        return;
                    }
                }
                self.steps.insert(len - 1, Step::Insert(text.to_string()));
            }
            _ => self.steps.push(Step::Insert(text.to_string())),
        }
    }

    pub(crate) fn finish(self) -> Vec<Step> {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(position: usize, text: &str) -> Component {
        Component::Insert {
            position,
            text: text.to_string(),
        }
    }

    fn del(position: usize, length: usize) -> Component {
        Component::Delete { position, length }
    }

    #[test]
    fn test_single_insert_lowers_with_gaps() {
        let edit = Edit::insert(5, 2, "xy").unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Retain(2), Step::Insert("xy".into()), Step::Retain(3)]
        );
        assert_eq!(edit.target_len(), 7);
    }

    #[test]
    fn test_positions_are_relative_to_prior_components() {
        // ">> hello" -> ">> " -> ">> bye"
        let edit = Edit::new(5, vec![ins(0, ">> "), del(3, 5), ins(3, "bye")]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Insert(">> bye".into()), Step::Delete(5)]
        );
        assert_eq!(edit.target_len(), 6);
    }

    #[test]
    fn test_retain_component_advances_cursor() {
        let edit = Edit::new(4, vec![Component::Retain { count: 2 }, del(2, 1)]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Retain(2), Step::Delete(1), Step::Retain(1)]
        );
    }

    #[test]
    fn test_out_of_order_component_rejected() {
        let err = Edit::new(10, vec![del(4, 2), del(2, 1)]).unwrap_err();
        assert!(matches!(err, OtError::MalformedEdit(_)));
    }

    #[test]
    fn test_insert_at_same_position_as_earlier_insert() {
        // "xyz" -> "xabyz" -> "xcabyz"
        let edit = Edit::new(3, vec![ins(1, "ab"), ins(1, "c")]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Retain(1), Step::Insert("cab".into()), Step::Retain(2)]
        );
        assert_eq!(edit.target_len(), 6);
        assert_eq!(crate::algebra::apply("xyz", &edit).unwrap(), "xcabyz");
    }

    #[test]
    fn test_delete_inside_earlier_insert() {
        // "xyz" -> "xabyz" -> "xayz"
        let edit = Edit::new(3, vec![ins(1, "ab"), del(2, 1)]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Retain(1), Step::Insert("a".into()), Step::Retain(2)]
        );
        assert_eq!(edit.target_len(), 4);
        assert_eq!(crate::algebra::apply("xyz", &edit).unwrap(), "xayz");
    }

    #[test]
    fn test_delete_spanning_inserted_and_base_text() {
        // "xyz" -> "xabyz" -> "xaz"
        let edit = Edit::new(3, vec![ins(1, "ab"), del(2, 2)]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![
                Step::Retain(1),
                Step::Insert("a".into()),
                Step::Delete(1),
                Step::Retain(1)
            ]
        );
    }

    #[test]
    fn test_oversized_counts_are_malformed() {
        let err = Edit::new(
            2,
            vec![
                Component::Retain { count: 1 },
                Component::Retain { count: usize::MAX },
            ],
        )
        .unwrap_err();
        assert!(matches!(err, OtError::MalformedEdit(_)));

        assert!(matches!(
            Edit::delete(4, 2, usize::MAX),
            Err(OtError::MalformedEdit(_))
        ));
        assert!(matches!(
            Edit::insert(4, usize::MAX, "x"),
            Err(OtError::MalformedEdit(_))
        ));
    }

    #[test]
    fn test_unvalidated_oversized_edit_fails_to_lower() {
        // Shaped like a decoded message, which skips `Edit::new`.
        let edit = Edit {
            base_len: 2,
            components: vec![
                Component::Retain { count: 1 },
                Component::Retain { count: usize::MAX },
            ],
        };
        assert!(matches!(edit.steps(), Err(OtError::MalformedEdit(_))));
        assert!(crate::algebra::apply("ab", &edit).is_err());
    }

    #[test]
    fn test_delete_past_end_rejected() {
        assert!(matches!(
            Edit::delete(5, 3, 3),
            Err(OtError::MalformedEdit(_))
        ));
        assert!(matches!(
            Edit::insert(5, 6, "x"),
            Err(OtError::MalformedEdit(_))
        ));
    }

    #[test]
    fn test_adjacent_deletes_merge() {
        let edit = Edit::new(6, vec![del(1, 2), del(1, 2)]).unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![Step::Retain(1), Step::Delete(4), Step::Retain(1)]
        );
    }

    #[test]
    fn test_builder_puts_insert_before_delete() {
        let mut b = StepBuilder::default();
        b.retain(1);
        b.delete(2);
        b.insert("a");
        b.insert("b");
        assert_eq!(
            b.finish(),
            vec![Step::Retain(1), Step::Insert("ab".into()), Step::Delete(2)]
        );
    }

    #[test]
    fn test_from_steps_is_positional() {
        let edit = Edit::from_steps(
            6,
            vec![
                Step::Retain(2),
                Step::Insert("é!".into()),
                Step::Delete(3),
                Step::Retain(1),
            ],
        );
        assert_eq!(edit.components(), &[ins(2, "é!"), del(4, 3)]);
        assert_eq!(edit.target_len(), 5);
    }

    #[test]
    fn test_noop_detection() {
        assert!(Edit::identity(4).is_noop());
        assert!(Edit::new(4, vec![Component::Retain { count: 4 }]).unwrap().is_noop());
        assert!(!Edit::delete(4, 0, 1).unwrap().is_noop());
    }

    #[test]
    fn test_replace_orders_insert_first() {
        let edit = Edit::replace(5, 1, 3, "EY").unwrap();
        assert_eq!(
            edit.steps().unwrap(),
            vec![
                Step::Retain(1),
                Step::Insert("EY".into()),
                Step::Delete(3),
                Step::Retain(1)
            ]
        );
    }
}
