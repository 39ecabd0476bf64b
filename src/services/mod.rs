/// Chat announcements and per-player prompts.
pub mod notifications;
/// Rating merge passes and monthly standings.
pub mod rating_service;
/// Keyed one-shot timers over a bounded worker pool.
pub mod scheduler;
/// Match lifecycle actions and timer handlers.
pub mod submission_service;
/// Execution of fired timer tasks and restart recovery.
pub mod task_runner;
/// Deadline computation for match timers.
pub mod timeouts;
