//! View Session - Request-scoped session binding ("open session in view").
//!
//! For every request the guard makes sure a database session is bound in the
//! request's ambient context while downstream handlers and view rendering
//! run, and closes it exactly once afterwards. When an enclosing scope has
//! already bound a session, the guard joins it and releases nothing.
//!
//! ## Architecture
//!
//! ```text
//! request ─► OpenSessionLayer ─► handlers ─► with_current_session(..)
//!               │   ▲                              │
//!               │   └── SessionScope (Drop: unbind + close)
//!               ▼                                  ▼
//!          AppRegistry ─► SessionFactoryHandle   ResourceContext (task-local)
//! ```
//!
//! Async and error re-dispatches of the same request are handled as fresh
//! dispatches by default; see [`DispatchPolicy`].

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod dispatch;
pub mod guard;
pub mod layer;
pub mod registry;
pub mod resources;
pub mod scope;
pub mod session;
pub mod sqlite;

pub use dispatch::{DispatchPolicy, DispatchType, FilterDecision};
pub use guard::OpenSessionInView;
pub use layer::{OpenSessionLayer, OpenSessionService, REQUEST_ID_HEADER};
pub use registry::AppRegistry;
pub use resources::{ResourceContext, ResourceKey};
pub use scope::{Participation, SessionScope};
pub use session::{
    with_current_session, with_current_session_as, FlushMode, Session, SessionFactory,
    SessionFactoryHandle, SessionHolder,
};
pub use sqlite::{SqliteSession, SqliteSessionFactory};
