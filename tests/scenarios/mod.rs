mod burst_ingestion;
mod concurrent_writers;
mod cursor_round_trip;
mod delete_without_archive;
mod host_identity;
mod resume;
mod watch_from_tail;
