//! API request handlers, organized by resource

pub mod decisions;
pub mod health;
pub mod projects;
pub mod session;
pub mod stream;
pub mod tasks;
pub mod workflows;

pub use decisions::{get_decision, list_decisions, resolve_decision};
pub use health::health;
pub use projects::{get_project, list_project_tasks, list_projects};
pub use session::get_session;
pub use stream::event_stream;
pub use tasks::{cancel_task, create_task, delete_task, get_task, list_tasks, pause_task, resume_task, run_task};
pub use workflows::{
    clone_workflow, create_workflow, delete_workflow, get_workflow, list_workflows, update_workflow,
};
