// Library root for the mealmate client core: configuration, wire types, the
// REST client and the session/routing state machines built on top of it.

pub mod api;
pub mod config;
pub mod guard;
pub mod poll;
pub mod protocol;
pub mod session;
pub mod settlement;
