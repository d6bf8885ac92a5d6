//! SQLite database for the Citewalk push pipeline.

citewalk_core::define_database!(PushDatabase, "Push database migrations complete");
