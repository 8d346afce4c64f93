//! The operation algebra: `apply`, `compose`, `transform`, `invert`.
//!
//! All four are pure functions. They lower their inputs into dense steps (see
//! [`crate::edit`]) and walk them in lock-step, splitting the longer of two
//! overlapping spans at every step.
//!
//! Convergence (TP1), for edits `a` and `b` computed against the same text:
//!
//! ```text
//! apply(apply(s, a), transform(b, a, Right)) == apply(apply(s, b), transform(a, b, Left))
//! ```

use crate::edit::{Edit, Step, StepBuilder};
use crate::error::{OtError, Result};

/// Tie-break for two inserts landing on the same position.
///
/// `Left` keeps the insert of the edit being transformed first, `Right` keeps
/// the other edit's insert first. Every replica must pick the same side for
/// the same pair of edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// The transformed edit's insert goes first.
    Left,
    /// The other edit's insert goes first.
    Right,
}

impl Priority {
    /// The side the other edit of a pair uses.
    pub fn opposite(self) -> Self {
        match self {
            Priority::Left => Priority::Right,
            Priority::Right => Priority::Left,
        }
    }
}

/// Apply `edit` to `text`.
pub fn apply(text: &str, edit: &Edit) -> Result<String> {
    let len = text.chars().count();
    if len != edit.base_len() {
        return Err(OtError::malformed(format!(
            "edit spans {} chars but the text has {len}",
            edit.base_len()
        )));
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    for step in edit.steps()? {
        match step {
            Step::Retain(n) => out.extend(chars.by_ref().take(n)),
            Step::Insert(inserted) => out.push_str(&inserted),
            Step::Delete(n) => chars.by_ref().take(n).for_each(drop),
        }
    }
    Ok(out)
}

/// Merge `a` followed by `b` into one equivalent edit.
pub fn compose(a: &Edit, b: &Edit) -> Result<Edit> {
    let incompatible = || OtError::IncompatibleEdit {
        left: a.target_len(),
        right: b.base_len(),
    };
    if a.target_len() != b.base_len() {
        return Err(incompatible());
    }

    let steps = compose_steps(a.steps()?, b.steps()?).ok_or_else(incompatible)?;
    Ok(Edit::from_steps(a.base_len(), steps))
}

/// Step-level [`compose`]. `None` when `xs` does not produce exactly the
/// text `ys` consumes.
pub(crate) fn compose_steps(xs: Vec<Step>, ys: Vec<Step>) -> Option<Vec<Step>> {
    let mut xs = Cursor::new(xs);
    let mut ys = Cursor::new(ys);
    let mut out = StepBuilder::default();

    loop {
        match (xs.peek(), ys.peek()) {
            (None, None) => break,
            // Deletes of `a` never reach `b`.
            (Some(Peek::Delete(n)), _) => {
                out.delete(n);
                xs.skip(n);
            }
            // Inserts of `b` do not consume anything from `a`.
            (_, Some(Peek::Insert(n))) => out.insert(&ys.take_text(n)),
            (None, Some(_)) | (Some(_), None) => return None,
            (Some(x), Some(y)) => {
                let n = x.len().min(y.len());
                match (x, y) {
                    (Peek::Retain(_), Peek::Retain(_)) => {
                        out.retain(n);
                        xs.skip(n);
                    }
                    (Peek::Retain(_), Peek::Delete(_)) => {
                        out.delete(n);
                        xs.skip(n);
                    }
                    (Peek::Insert(_), Peek::Retain(_)) => out.insert(&xs.take_text(n)),
                    // Text inserted by `a` and removed by `b` cancels out.
                    (Peek::Insert(_), Peek::Delete(_)) => xs.skip(n),
                    // Consumed by the outer arms.
                    (Peek::Delete(_), _) | (_, Peek::Insert(_)) => {}
                }
                ys.skip(n);
            }
        }
    }

    Some(out.finish())
}

/// Rewrite `a` so it applies after `b`, both computed against the same text.
pub fn transform(a: &Edit, b: &Edit, priority: Priority) -> Result<Edit> {
    let incompatible = || OtError::IncompatibleEdit {
        left: a.base_len(),
        right: b.base_len(),
    };
    if a.base_len() != b.base_len() {
        return Err(incompatible());
    }

    let mut xs = Cursor::new(a.steps()?);
    let mut ys = Cursor::new(b.steps()?);
    let mut out = StepBuilder::default();

    loop {
        match (xs.peek(), ys.peek()) {
            (None, None) => break,
            (Some(Peek::Insert(_)), Some(Peek::Insert(n))) if priority == Priority::Right => {
                out.retain(n);
                ys.skip(n);
            }
            (Some(Peek::Insert(n)), _) => out.insert(&xs.take_text(n)),
            (_, Some(Peek::Insert(n))) => {
                out.retain(n);
                ys.skip(n);
            }
            (None, Some(_)) | (Some(_), None) => return Err(incompatible()),
            (Some(x), Some(y)) => {
                let n = x.len().min(y.len());
                match (x, y) {
                    (Peek::Retain(_), Peek::Retain(_)) => out.retain(n),
                    (Peek::Delete(_), Peek::Retain(_)) => out.delete(n),
                    // Already gone once `b` is applied.
                    (Peek::Delete(_), Peek::Delete(_)) | (Peek::Retain(_), Peek::Delete(_)) => {}
                    (Peek::Insert(_), _) | (_, Peek::Insert(_)) => {}
                }
                xs.skip(n);
                ys.skip(n);
            }
        }
    }

    Ok(Edit::from_steps(b.target_len(), out.finish()))
}

/// Transform both sides at once: `(a after b, b after a)`, with `priority`
/// applying to `a` and its opposite to `b`.
pub fn transform_pair(a: &Edit, b: &Edit, priority: Priority) -> Result<(Edit, Edit)> {
    Ok((
        transform(a, b, priority)?,
        transform(b, a, priority.opposite())?,
    ))
}

/// The edit that undoes `edit` on `apply(original, edit)`.
pub fn invert(edit: &Edit, original: &str) -> Result<Edit> {
    let len = original.chars().count();
    if len != edit.base_len() {
        return Err(OtError::malformed(format!(
            "edit spans {} chars but the original text has {len}",
            edit.base_len()
        )));
    }

    let mut chars = original.chars();
    let mut out = StepBuilder::default();
    for step in edit.steps()? {
        match step {
            Step::Retain(n) => {
                chars.by_ref().take(n).for_each(drop);
                out.retain(n);
            }
            Step::Insert(inserted) => out.delete(inserted.chars().count()),
            Step::Delete(n) => {
                let removed: String = chars.by_ref().take(n).collect();
                out.insert(&removed);
            }
        }
    }

    Ok(Edit::from_steps(edit.target_len(), out.finish()))
}

/// Shape and length of the step at the head of a [`Cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peek {
    Retain(usize),
    Insert(usize),
    Delete(usize),
}

impl Peek {
    fn len(self) -> usize {
        match self {
            Peek::Retain(n) | Peek::Insert(n) | Peek::Delete(n) => n,
        }
    }
}

/// Walks a step list, handing out partial steps.
struct Cursor {
    rest: std::vec::IntoIter<Step>,
    head: Option<Step>,
    head_len: usize,
}

impl Cursor {
    fn new(steps: Vec<Step>) -> Self {
        let mut cursor = Self {
            rest: steps.into_iter(),
            head: None,
            head_len: 0,
        };
        cursor.advance();
        cursor
    }

    fn advance(&mut self) {
        self.head = self.rest.next();
        self.head_len = match &self.head {
            Some(Step::Retain(n)) | Some(Step::Delete(n)) => *n,
            Some(Step::Insert(text)) => text.chars().count(),
            None => 0,
        };
    }

    fn peek(&self) -> Option<Peek> {
        self.head.as_ref().map(|step| match step {
            Step::Retain(_) => Peek::Retain(self.head_len),
            Step::Insert(_) => Peek::Insert(self.head_len),
            Step::Delete(_) => Peek::Delete(self.head_len),
        })
    }

    /// Consume `n` chars of the head step.
    fn skip(&mut self, n: usize) {
        self.take_text(n);
    }

    /// Consume `n` chars of the head step, returning them if it is an insert.
    fn take_text(&mut self, n: usize) -> String {
        let n = n.min(self.head_len);
        let mut taken = String::new();
        match &mut self.head {
            Some(Step::Insert(text)) => {
                let split = text
                    .char_indices()
                    .nth(n)
                    .map_or(text.len(), |(index, _)| index);
                let tail = text.split_off(split);
                taken = std::mem::replace(text, tail);
            }
            Some(Step::Retain(len)) | Some(Step::Delete(len)) => *len -= n,
            None => return taken,
        }
        self.head_len -= n;
        if self.head_len == 0 {
            self.advance();
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::Component;

    #[test]
    fn test_apply_insert_and_delete() {
        let edit = Edit::insert(5, 5, " world").unwrap();
        assert_eq!(apply("hello", &edit).unwrap(), "hello world");

        let edit = Edit::delete(5, 1, 3).unwrap();
        assert_eq!(apply("hello", &edit).unwrap(), "ho");
    }

    #[test]
    fn test_apply_multibyte() {
        let edit = Edit::replace(4, 1, 2, "ß").unwrap();
        assert_eq!(apply("añëz", &edit).unwrap(), "aßz");
    }

    #[test]
    fn test_apply_wrong_length_is_malformed() {
        let edit = Edit::insert(3, 0, "x").unwrap();
        assert!(matches!(
            apply("hello", &edit),
            Err(OtError::MalformedEdit(_))
        ));
    }

    #[test]
    fn test_apply_rejects_malformed_deserialized_shape() {
        // Built without validation, as a decoded message could be.
        let edit = Edit::from_steps(2, vec![Step::Delete(3)]);
        assert!(apply("ab", &edit).is_err());
    }

    #[test]
    fn test_compose_sequential_edits() {
        let a = Edit::insert(5, 5, " world").unwrap();
        let b = Edit::delete(11, 0, 6).unwrap();
        let c = compose(&a, &b).unwrap();
        assert_eq!(apply("hello", &c).unwrap(), "world");
        assert_eq!(c.base_len(), 5);
        assert_eq!(c.target_len(), 5);
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = Edit::insert(3, 1, "xyz").unwrap();
        let b = Edit::delete(6, 1, 3).unwrap();
        let c = compose(&a, &b).unwrap();
        assert!(c.is_noop());
        assert_eq!(apply("abc", &c).unwrap(), "abc");
    }

    #[test]
    fn test_compose_length_mismatch() {
        let a = Edit::insert(3, 0, "x").unwrap();
        let b = Edit::delete(3, 0, 1).unwrap();
        assert_eq!(
            compose(&a, &b),
            Err(OtError::IncompatibleEdit { left: 4, right: 3 })
        );
    }

    #[test]
    fn test_transform_insert_after_deleted_span() {
        // "hello": X appends, Y deletes "hello".
        let x = Edit::insert(5, 5, " world").unwrap();
        let y = Edit::delete(5, 0, 5).unwrap();

        let y_after_x = transform(&y, &x, Priority::Right).unwrap();
        assert_eq!(
            y_after_x.components(),
            &[Component::Delete {
                position: 0,
                length: 5
            }]
        );
        assert_eq!(apply("hello world", &y_after_x).unwrap(), " world");

        let x_after_y = transform(&x, &y, Priority::Left).unwrap();
        assert_eq!(apply("", &x_after_y).unwrap(), " world");
    }

    #[test]
    fn test_transform_tie_break() {
        let x = Edit::insert(3, 2, "X").unwrap();
        let y = Edit::insert(3, 2, "Y").unwrap();

        // X keeps its place ahead of Y on both paths.
        let x_then = apply(
            &apply("abc", &x).unwrap(),
            &transform(&y, &x, Priority::Right).unwrap(),
        )
        .unwrap();
        let y_then = apply(
            &apply("abc", &y).unwrap(),
            &transform(&x, &y, Priority::Left).unwrap(),
        )
        .unwrap();
        assert_eq!(x_then, "abXYc");
        assert_eq!(y_then, "abXYc");
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let a = Edit::delete(10, 2, 5).unwrap(); // removes 2..7
        let b = Edit::delete(10, 4, 5).unwrap(); // removes 4..9
        let (a2, b2) = transform_pair(&a, &b, Priority::Left).unwrap();

        let s = "0123456789";
        let left = apply(&apply(s, &a).unwrap(), &b2).unwrap();
        let right = apply(&apply(s, &b).unwrap(), &a2).unwrap();
        assert_eq!(left, "019");
        assert_eq!(left, right);
        assert_eq!(
            a2.components(),
            &[Component::Delete {
                position: 2,
                length: 2
            }]
        );
    }

    #[test]
    fn test_transform_delete_around_insert() {
        let a = Edit::delete(6, 1, 4).unwrap();
        let b = Edit::insert(6, 3, "++").unwrap();
        let (a2, b2) = transform_pair(&a, &b, Priority::Left).unwrap();
        let s = "abcdef";
        let left = apply(&apply(s, &a).unwrap(), &b2).unwrap();
        let right = apply(&apply(s, &b).unwrap(), &a2).unwrap();
        assert_eq!(left, "a++f");
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_incompatible() {
        let a = Edit::insert(3, 0, "x").unwrap();
        let b = Edit::insert(4, 0, "y").unwrap();
        assert_eq!(
            transform(&a, &b, Priority::Left),
            Err(OtError::IncompatibleEdit { left: 3, right: 4 })
        );
    }

    #[test]
    fn test_invert_roundtrip() {
        let s = "the quick brown fox";
        let edit = Edit::new(
            19,
            vec![
                Component::Delete {
                    position: 4,
                    length: 6,
                },
                Component::Insert {
                    position: 4,
                    text: "slow ".into(),
                },
                Component::Insert {
                    position: 18,
                    text: "!".into(),
                },
            ],
        )
        .unwrap();
        let changed = apply(s, &edit).unwrap();
        assert_eq!(changed, "the slow brown fox!");
        let inverse = invert(&edit, s).unwrap();
        assert_eq!(inverse.base_len(), changed.chars().count());
        assert_eq!(apply(&changed, &inverse).unwrap(), s);
    }

    #[test]
    fn test_invert_wrong_original() {
        let edit = Edit::delete(4, 0, 1).unwrap();
        assert!(matches!(invert(&edit, "ab"), Err(OtError::MalformedEdit(_))));
    }

    #[test]
    fn test_priority_opposite() {
        assert_eq!(Priority::Left.opposite(), Priority::Right);
        assert_eq!(Priority::Right.opposite(), Priority::Left);
    }
}
