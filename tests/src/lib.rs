//! End-to-end scenarios over a real mmap'd segment: attach, publish,
//! dispatch, quiescence and reclamation, exercised across the whole
//! workspace.

#[cfg(test)]
mod common;
#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;
