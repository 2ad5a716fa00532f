// Library root for the headless runner so integration tests can reach the
// console front end.

pub mod app;
