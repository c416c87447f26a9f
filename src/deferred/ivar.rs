//! Single-assignment cells.
//!
//! An [`Ivar`] is the write end of a future: a cell that is filled at most
//! once and holds a list of handlers while empty. Filling enqueues every
//! live handler as a job in the context captured when the handler was
//! attached — handlers never run synchronously inside `fill`, which keeps
//! recursion bounded and interleaving fair.
//!
//! # Indirection compression
//!
//! A cell whose only role is to forward another cell's value (the result of
//! a `bind` chain) is collapsed to an `Indir` alias by [`Ivar::connect`].
//! Lookups squash chains with path compression, so long tail-call-shaped
//! chains do not accumulate a hop per link.
//!
//! # Handler removal
//!
//! Removal is O(1): a shared flag is set and the handler is skipped (and
//! dropped) when its cell fills or its list is compacted. `choose` uses
//! this to detach losing alternatives.

use crate::context::ExecutionContext;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::Scheduler;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

type CellRef<T> = Rc<RefCell<CellState<T>>>;

pub(crate) struct Handler<T> {
    run: Box<dyn FnOnce(T)>,
    context: ExecutionContext,
    removed: Rc<Cell<bool>>,
}

enum CellState<T> {
    /// Not yet determined; handlers wait in attachment order. The inline-1
    /// storage is the single-handler fast path.
    Empty { handlers: SmallVec<[Handler<T>; 1]> },
    /// Forwarded to another cell by indirection compression.
    Indir { target: CellRef<T> },
    /// Determined. Immutable from here on; the handler list is gone.
    Full { value: T },
}

/// A token for a registered handler; dropping it does nothing, calling
/// [`remove`][Self::remove] detaches the handler in O(1).
pub(crate) struct HandlerToken {
    removed: Rc<Cell<bool>>,
}

impl HandlerToken {
    pub(crate) fn remove(&self) {
        self.removed.set(true);
    }
}

/// A single-assignment cell; the write end of a [`Deferred`].
///
/// [`Deferred`]: crate::deferred::Deferred
pub struct Ivar<T> {
    cell: CellRef<T>,
}

impl<T> Clone for Ivar<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: 'static> Ivar<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn create() -> Self {
        Self {
            cell: Rc::new(RefCell::new(CellState::Empty {
                handlers: SmallVec::new(),
            })),
        }
    }

    /// Returns the read-only view of this cell.
    #[must_use]
    pub fn read(&self) -> crate::deferred::Deferred<T> {
        crate::deferred::Deferred::of_ivar(self.clone())
    }

    /// Follows indirections to the canonical cell, compressing the path.
    fn root(&self) -> CellRef<T> {
        let mut current = self.cell.clone();
        loop {
            let next = match &*current.borrow() {
                CellState::Indir { target } => target.clone(),
                _ => break,
            };
            current = next;
        }
        let root = current;
        if !Rc::ptr_eq(&self.cell, &root) {
            let mut walk = self.cell.clone();
            while !Rc::ptr_eq(&walk, &root) {
                let next = match &mut *walk.borrow_mut() {
                    CellState::Indir { target } => {
                        let next = target.clone();
                        *target = root.clone();
                        next
                    }
                    _ => break,
                };
                walk = next;
            }
        }
        root
    }

    /// Returns true if both handles resolve to the same cell.
    #[must_use]
    pub fn same_cell(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.root(), &b.root())
    }

    /// Returns true once the cell has been filled.
    #[must_use]
    pub fn is_determined(&self) -> bool {
        matches!(&*self.root().borrow(), CellState::Full { .. })
    }
}

impl<T: Clone + 'static> Ivar<T> {
    /// Returns the value if determined.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        match &*self.root().borrow() {
            CellState::Full { value } => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the value, failing with `NotDetermined` if the cell is
    /// still empty.
    pub fn value(&self) -> Result<T> {
        self.peek()
            .ok_or_else(|| Error::new(ErrorKind::NotDetermined))
    }

    /// Fills the cell, enqueuing every waiting handler as a job.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already full; double fill is a programmer
    /// error. Use [`try_fill`][Self::try_fill] or
    /// [`fill_if_empty`][Self::fill_if_empty] for the total variants.
    pub fn fill(&self, value: T) {
        if self.try_fill(value).is_err() {
            panic!("fill of an already-full ivar");
        }
    }

    /// Fills the cell, reporting `AlreadyFull` instead of panicking.
    pub fn try_fill(&self, value: T) -> Result<()> {
        let root = self.root();
        let handlers = {
            let mut state = root.borrow_mut();
            match &mut *state {
                CellState::Full { .. } => {
                    return Err(Error::new(ErrorKind::AlreadyFull));
                }
                CellState::Empty { handlers } => {
                    let handlers = std::mem::take(handlers);
                    *state = CellState::Full {
                        value: value.clone(),
                    };
                    handlers
                }
                CellState::Indir { .. } => unreachable!("root cell cannot be an indirection"),
            }
        };
        schedule_handlers(handlers, &value);
        Ok(())
    }

    /// Fills the cell if it is still empty. Returns false (and drops the
    /// value) if it was already full.
    pub fn fill_if_empty(&self, value: T) -> bool {
        self.try_fill(value).is_ok()
    }

    /// Attaches a handler that runs as a job (in the current context) once
    /// the cell is determined. If it already is, the job is enqueued
    /// immediately.
    pub fn upon(&self, run: impl FnOnce(T) + 'static) {
        let context = Scheduler::current().current_context();
        let _ = self.add_handler_in(context, Box::new(run));
    }

    /// Attaches a removable handler in an explicit context.
    pub(crate) fn add_handler_in(
        &self,
        context: ExecutionContext,
        run: Box<dyn FnOnce(T)>,
    ) -> HandlerToken {
        let removed = Rc::new(Cell::new(false));
        let root = self.root();
        let mut run_slot = Some(run);
        let full_value = {
            let mut state = root.borrow_mut();
            match &mut *state {
                CellState::Full { value } => Some(value.clone()),
                CellState::Empty { handlers } => {
                    compact(handlers);
                    handlers.push(Handler {
                        run: run_slot.take().expect("handler closure present"),
                        context: context.clone(),
                        removed: removed.clone(),
                    });
                    None
                }
                CellState::Indir { .. } => unreachable!("root cell cannot be an indirection"),
            }
        };
        if let Some(value) = full_value {
            let run = run_slot.take().expect("handler closure present");
            let flag = removed.clone();
            Scheduler::current().enqueue(
                context,
                Box::new(move || {
                    if !flag.get() {
                        run(value);
                    }
                }),
            );
        }
        HandlerToken { removed }
    }

    /// Collapses `rhs` into `result`: `rhs` becomes an alias of `result`
    /// and its waiting handlers move onto `result`'s list. If `rhs` was
    /// already determined, `result` is filled with its value instead.
    ///
    /// Used by `bind` so that chained binds forward through one cell
    /// rather than stacking a handler per link.
    pub(crate) fn connect(result: &Self, rhs: &Self) {
        let result_root = result.root();
        let rhs_root = rhs.root();
        if Rc::ptr_eq(&result_root, &rhs_root) {
            return;
        }

        let rhs_state = std::mem::replace(
            &mut *rhs_root.borrow_mut(),
            CellState::Indir {
                target: result_root.clone(),
            },
        );

        match rhs_state {
            CellState::Empty { handlers: moved } => {
                let scheduled = {
                    let mut state = result_root.borrow_mut();
                    match &mut *state {
                        CellState::Empty { handlers } => {
                            handlers.extend(moved);
                            None
                        }
                        CellState::Full { value } => Some((moved, value.clone())),
                        CellState::Indir { .. } => {
                            unreachable!("root cell cannot be an indirection")
                        }
                    }
                };
                if let Some((handlers, value)) = scheduled {
                    schedule_handlers(handlers, &value);
                }
            }
            CellState::Full { value } => {
                let result = Self { cell: result_root };
                if result.try_fill(value).is_err() {
                    debug_assert!(false, "connect of two determined cells");
                }
            }
            CellState::Indir { .. } => unreachable!("root cell cannot be an indirection"),
        }
    }
}

/// Drops tombstoned handlers once they dominate a long list.
fn compact<T>(handlers: &mut SmallVec<[Handler<T>; 1]>) {
    if handlers.len() >= 8 {
        let dead = handlers.iter().filter(|h| h.removed.get()).count();
        if dead * 2 > handlers.len() {
            handlers.retain(|h| !h.removed.get());
        }
    }
}

fn schedule_handlers<T: Clone + 'static>(
    handlers: SmallVec<[Handler<T>; 1]>,
    value: &T,
) {
    if handlers.is_empty() {
        return;
    }
    let scheduler = Scheduler::current();
    for handler in handlers {
        if handler.removed.get() {
            continue;
        }
        let Handler {
            run,
            context,
            removed,
        } = handler;
        let v = value.clone();
        // The flag is re-checked at run time: a handler can lose a choose
        // race after its job has been enqueued.
        scheduler.enqueue(
            context,
            Box::new(move || {
                if !removed.get() {
                    run(v);
                }
            }),
        );
    }
}

impl<T> fmt::Debug for Ivar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.cell.borrow() {
            CellState::Empty { handlers } => format!("Empty({} handlers)", handlers.len()),
            CellState::Indir { .. } => "Indir".to_string(),
            CellState::Full { .. } => "Full".to_string(),
        };
        write!(f, "Ivar({state})")
    }
}
