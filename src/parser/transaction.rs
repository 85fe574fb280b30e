/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

// Parser transactions: every parse primitive runs inside a frame that
// saves the cursor. A failing frame rolls the cursor back when the caller
// asked for a speculative parse; `no_rollback` commits the frame so that
// later failures inside it become fatal. The deepest failing frame's stage
// stack is kept for the syntax-error breadcrumb.

use super::Parser;

#[derive(Debug)]
pub enum ParseError {
    /// The current token could not be parsed at this stage.
    Invalid(String),
}

pub type PResult<T> = Result<T, ParseError>;

pub(super) fn inv(reason: impl Into<String>) -> ParseError {
    ParseError::Invalid(reason.into())
}

#[derive(Debug)]
pub(super) struct Frame {
    pub stage: Option<String>,
    pub no_rollback: bool,
}

impl Parser {
    /// Runs `f` inside a transaction frame. With `maybe` set, an
    /// `Invalid` failure restores the cursor and yields `None` unless the
    /// frame was committed with `no_rollback`.
    pub(super) fn txn<T>(
        &mut self,
        stage: Option<String>,
        maybe: bool,
        f: impl FnOnce(&mut Self) -> PResult<T>,
    ) -> PResult<Option<T>> {
        let saved_pos = self.pos;
        self.frames.push(Frame {
            stage,
            no_rollback: false,
        });

        let result = f(self);

        let no_rollback = self.frames.last().map(|fr| fr.no_rollback).unwrap_or(false);
        let snapshot: Vec<String> = self
            .frames
            .iter()
            .filter_map(|fr| fr.stage.clone())
            .collect();
        self.frames.pop();

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                // The deepest failing frame pins the error position and
                // the stage breadcrumb.
                if self.last_error_stages.is_none() {
                    self.pos = saved_pos;
                    self.last_error_stages = Some(snapshot);
                }
                if maybe && !no_rollback {
                    self.pos = saved_pos;
                    self.last_error_stages = None;
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// A non-speculative transaction: failures always propagate.
    pub(super) fn txn_must<T>(
        &mut self,
        stage: Option<String>,
        f: impl FnOnce(&mut Self) -> PResult<T>,
    ) -> PResult<T> {
        match self.txn(stage, false, f)? {
            Some(value) => Ok(value),
            None => unreachable!("non-maybe transaction cannot be rolled back"),
        }
    }

    /// Commits the innermost frame: a later `Invalid` inside it is no
    /// longer rolled back but re-raised as a fatal syntax error.
    pub(super) fn no_rollback(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.no_rollback = true;
        }
    }
}
