//! Step identity and step definitions.
//!
//! Every flow names its steps with its own `enum` implementing [`StepKey`].
//! The enum value is the only control-flow identity of a step; numeric
//! positions exist only for display (see [`FlowProgress`](crate::FlowProgress)).

use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;

use crate::{FieldStore, PersistenceAdapter};

/// Identity of a step within one flow.
///
/// Implemented by a small `Copy` enum per flow.
///
/// # Examples
///
/// ```
/// use stepwise::StepKey;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// enum Signup {
///     Account,
///     Profile,
///     Done,
/// }
///
/// impl StepKey for Signup {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::Account => "account",
///             Self::Profile => "profile",
///             Self::Done => "done",
///         }
///     }
/// }
///
/// assert_eq!(Signup::Profile.name(), "profile");
/// ```
pub trait StepKey: Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// Returns a stable, human-readable name for this step.
    ///
    /// Names are used in logs, events, and the completion marker written
    /// to backend entities, so they must not change between releases.
    fn name(&self) -> &'static str;
}

/// A branch selector: pure routing over the current field snapshot.
pub type BranchSelector<S> = Arc<dyn Fn(&FieldStore) -> S + Send + Sync>;

/// How a step picks its successor.
pub enum Routing<S: StepKey> {
    /// Always continue to the given step.
    Fixed(S),

    /// Pick one of `targets` by evaluating `selector` on the fields at the
    /// moment of advancing.
    Branch {
        /// Every step the selector may return.
        targets: Vec<S>,
        /// The routing function.
        selector: BranchSelector<S>,
    },

    /// The step ends the flow.
    Terminal,
}

impl<S: StepKey> Clone for Routing<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(next) => Self::Fixed(*next),
            Self::Branch { targets, selector } => Self::Branch {
                targets: targets.clone(),
                selector: Arc::clone(selector),
            },
            Self::Terminal => Self::Terminal,
        }
    }
}

impl<S: StepKey> Debug for Routing<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(next) => f.debug_tuple("Fixed").field(next).finish(),
            Self::Branch { targets, .. } => f
                .debug_struct("Branch")
                .field("targets", targets)
                .finish_non_exhaustive(),
            Self::Terminal => f.write_str("Terminal"),
        }
    }
}

impl<S: StepKey> Routing<S> {
    /// Returns every step this routing can lead to.
    pub fn targets(&self) -> Vec<S> {
        match self {
            Self::Fixed(next) => vec![*next],
            Self::Branch { targets, .. } => targets.clone(),
            Self::Terminal => Vec::new(),
        }
    }
}

/// Immutable definition of one step in a flow.
#[derive(Clone)]
pub struct StepDefinition<S: StepKey> {
    /// The step identity.
    pub id: S,
    /// Adapter run before advancing past this step, if the step persists.
    pub persist: Option<Arc<dyn PersistenceAdapter>>,
    /// Successor rule.
    pub routing: Routing<S>,
}

impl<S: StepKey> StepDefinition<S> {
    /// Creates a non-persisting definition with the given routing.
    pub fn new(id: S, routing: Routing<S>) -> Self {
        Self {
            id,
            persist: None,
            routing,
        }
    }

    /// Attaches a persistence adapter.
    pub fn with_persist(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persist = Some(adapter);
        self
    }

    /// Returns true if this step ends the flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self.routing, Routing::Terminal)
    }

    /// Returns true if advancing past this step writes to the backend.
    pub fn persists(&self) -> bool {
        self.persist.is_some()
    }
}

impl<S: StepKey> Debug for StepDefinition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("persists", &self.persists())
            .field("routing", &self.routing)
            .finish()
    }
}
