/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Content-addressed interning of frames and stacks.
//!
//! Both tables assign dense indices in first-seen order and never shrink:
//! memory grows only with the number of distinct frames and call chains
//! ever observed, not with tick count. The `new_*` lists record entries
//! added during the current tick so incremental symbol data can be reported
//! externally; they are cleared by [`Interner::begin_tick`].

use std::collections::HashMap;

use crate::trace::Frame;

#[derive(Default)]
pub struct Interner {
    frames: Vec<Frame>,
    frame_index: HashMap<Frame, u32>,
    new_frames: Vec<u32>,

    stacks: Vec<Vec<u32>>,
    stack_index: HashMap<Vec<u32>, u32>,
    new_stacks: Vec<u32>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget which entries were "new": called at the start of every tick.
    pub fn begin_tick(&mut self) {
        self.new_frames.clear();
        self.new_stacks.clear();
    }

    /// Return the dense index for `frame`, assigning the next one if the
    /// frame has not been seen before.
    pub fn intern_frame(&mut self, frame: Frame) -> u32 {
        if let Some(&index) = self.frame_index.get(&frame) {
            return index;
        }
        let index = self.frames.len() as u32;
        self.frames.push(frame.clone());
        self.frame_index.insert(frame, index);
        self.new_frames.push(index);
        index
    }

    /// Return the dense index for the call chain `frames` (frame indices,
    /// most recent call first).
    pub fn intern_stack(&mut self, frames: Vec<u32>) -> u32 {
        if let Some(&index) = self.stack_index.get(&frames) {
            return index;
        }
        let index = self.stacks.len() as u32;
        self.stacks.push(frames.clone());
        self.stack_index.insert(frames, index);
        self.new_stacks.push(index);
        index
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn stacks(&self) -> &[Vec<u32>] {
        &self.stacks
    }

    pub fn new_frames(&self) -> &[u32] {
        &self.new_frames
    }

    pub fn new_stacks(&self) -> &[u32] {
        &self.new_stacks
    }
}
