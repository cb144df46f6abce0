// Renderer - the frame loop
//
// Each frame:
//   1. wait on the fence of the image submitted last frame
//   2. acquire the next image (out-of-date ends the frame as Stale)
//   3. wait on that image's fence if it is a different one, then reset it
//   4. record every task into its command buffer for that image
//   5. submit them in one batch signalling the image fence
//   6. present (suboptimal / out-of-date reports Stale)
//
// Command buffers are allocated per task per swapchain image, so the only
// thing that can still be in use when a frame starts is the image's own
// previous submission, which its fence covers.

pub mod frames;

pub use frames::VulkanFrames;

use anyhow::{Context, Result};

use crate::backend::{AcquiredImage, CommandRecorder, SurfaceStatus};
use crate::error::GfxError;

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing to render (no tasks, or a zero-sized drawable)
    Idle,
    /// Submitted and presented
    Presented,
    /// The swapchain needs rebuilding before the next frame
    Stale,
}

/// Passed to each task while recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Swapchain image being rendered
    pub image_index: u32,
    /// Frames presented before this one
    pub frame_number: u64,
}

pub type RecordFn = Box<dyn FnMut(&mut dyn CommandRecorder, FrameInfo) -> Result<()> + Send>;

/// Everything the frame loop needs from the GPU side
pub trait FrameBackend {
    /// Per-image command buffer handle
    type Commands: Copy + std::fmt::Debug;
    type Recorder<'a>: CommandRecorder
    where
        Self: 'a;

    fn image_count(&self) -> u32;

    fn allocate_commands(&mut self, count: u32) -> Result<Vec<Self::Commands>>;
    fn free_commands(&mut self, commands: Vec<Self::Commands>);

    /// Replace the per-image fences with `count` signaled ones
    fn resize_fences(&mut self, count: u32) -> Result<()>;
    fn wait_fence(&mut self, image: u32) -> Result<()>;
    fn reset_fence(&mut self, image: u32) -> Result<()>;
    fn wait_all(&mut self) -> Result<()>;

    fn acquire(&mut self) -> Result<SurfaceStatus<AcquiredImage>>;

    fn begin_commands(&mut self, commands: Self::Commands) -> Result<()>;
    fn recorder(&self, commands: Self::Commands) -> Self::Recorder<'_>;
    fn end_commands(&mut self, commands: Self::Commands) -> Result<()>;

    /// Submit after the acquire, signalling `image`'s fence
    fn submit(&mut self, commands: &[Self::Commands], image: u32) -> Result<()>;
    fn present(&mut self, image: u32) -> Result<SurfaceStatus<()>>;
}

struct Task<C> {
    record: RecordFn,
    /// One per swapchain image
    commands: Vec<C>,
}

pub struct Renderer<B: FrameBackend> {
    tasks: Vec<Task<B::Commands>>,
    image_count: u32,
    last_image: Option<u32>,
    frame_number: u64,
    backend: B,
}

impl<B: FrameBackend> Renderer<B> {
    pub fn new(backend: B) -> Self {
        let image_count = backend.image_count();
        Self {
            tasks: Vec::new(),
            image_count,
            last_image: None,
            frame_number: 0,
            backend,
        }
    }

    /// Register a recording task. Tasks record in registration order.
    pub fn add_task<F>(&mut self, record: F) -> Result<()>
    where
        F: FnMut(&mut dyn CommandRecorder, FrameInfo) -> Result<()> + Send + 'static,
    {
        let commands = self
            .backend
            .allocate_commands(self.image_count)
            .context("Failed to allocate task command buffers")?;
        self.tasks.push(Task {
            record: Box::new(record),
            commands,
        });
        log::debug!("Added render task #{}", self.tasks.len());
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Render and present one frame
    pub fn render(&mut self) -> Result<FrameOutcome> {
        if self.tasks.is_empty() {
            return Ok(FrameOutcome::Idle);
        }

        if let Some(last) = self.last_image {
            self.backend
                .wait_fence(last)
                .context("Waiting on previous frame")?;
        }

        let acquired = match self.backend.acquire()? {
            SurfaceStatus::Ready(acquired) => acquired,
            SurfaceStatus::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                return Ok(FrameOutcome::Stale);
            }
        };
        let image = acquired.index;
        if image >= self.image_count {
            return Err(GfxError::ImageIndexOutOfRange {
                index: image,
                count: self.image_count,
            }
            .into());
        }

        if self.last_image != Some(image) {
            self.backend
                .wait_fence(image)
                .context("Waiting on swapchain image")?;
        }
        self.backend.reset_fence(image)?;

        let frame = FrameInfo {
            image_index: image,
            frame_number: self.frame_number,
        };

        let mut batch = Vec::with_capacity(self.tasks.len());
        for (index, task) in self.tasks.iter_mut().enumerate() {
            let commands = task.commands[image as usize];
            self.backend.begin_commands(commands)?;
            {
                let mut recorder = self.backend.recorder(commands);
                (task.record)(&mut recorder, frame)
                    .with_context(|| format!("Render task #{} failed", index + 1))?;
            }
            self.backend.end_commands(commands)?;
            batch.push(commands);
        }

        self.backend.submit(&batch, image)?;
        self.last_image = Some(image);

        let presented = self.backend.present(image)?;
        self.frame_number += 1;

        match presented {
            SurfaceStatus::Ready(()) if !acquired.suboptimal => Ok(FrameOutcome::Presented),
            _ => {
                log::debug!("Swapchain stale after present");
                Ok(FrameOutcome::Stale)
            }
        }
    }

    /// Bring per-image state in line with the swapchain after a rebuild.
    /// A no-op while the image count is unchanged.
    pub fn reconcile(&mut self) -> Result<()> {
        let count = self.backend.image_count();
        if count == self.image_count {
            return Ok(());
        }

        log::info!(
            "Swapchain image count changed {} -> {}, reallocating frame state",
            self.image_count,
            count
        );

        self.backend.wait_all()?;
        self.backend.resize_fences(count)?;
        for task in &mut self.tasks {
            let old = std::mem::take(&mut task.commands);
            self.backend.free_commands(old);
            task.commands = self.backend.allocate_commands(count)?;
        }

        self.image_count = count;
        self.last_image = None;
        Ok(())
    }

    /// Block until every submitted frame has finished
    pub fn wait(&mut self) -> Result<()> {
        self.backend.wait_all()
    }
}
