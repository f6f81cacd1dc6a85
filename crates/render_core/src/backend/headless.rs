//! Software GPU timeline.
//!
//! Command lists are executed in submission order by a worker thread that
//! stands in for the GPU queue. The fence completes when the worker reaches a
//! signal, either after an optional latency ([`CompletionMode::Auto`]) or when
//! a test releases it ([`CompletionMode::Manual`]).
//!
//! The worker validates the resource states every command needs. A mismatch
//! means the recorded barriers were wrong; the device is then marked removed
//! and every later fence query fails with [`GpuError::DeviceRemoved`].
//!
//! On the CPU side the device tracks which buffer ranges and command
//! allocators are referenced by work that has not completed. Touching them
//! from the CPU is recorded as a [`Hazard`] instead of failing, so tests can
//! assert that a run was hazard-free.

use crate::acceleration::InstanceDesc;
use crate::buffer::{align_up, BufferDesc, BufferUsage, Residency, ResourceState};
use crate::config::{BackBufferOrder, RenderConfig};
use crate::device::{
    AccelerationStructureInputs, AccelerationStructureKind, AllocatorId, BufferId, BufferRange,
    DeviceLimits, DispatchRaysDesc, GpuCommand, GpuDevice, PipelineId, PrebuildInfo,
    ShaderIdentifier, ShaderTableRegion, SHADER_IDENTIFIER_SIZE,
};
use crate::error::{GpuError, GpuResult};
use crate::shader::RaytracingPipelineDesc;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ADDRESS_BASE: u64 = 0x1000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;
const MAX_BUFFER_SIZE: u64 = 256 << 20;
const UNSIGNALED: u64 = u64::MAX;
const BLAS_MAGIC: &[u8; 4] = b"BLAS";
const TLAS_MAGIC: &[u8; 4] = b"TLAS";
const INSTANCE_SIZE: u64 = std::mem::size_of::<InstanceDesc>() as u64;

/// When the simulated GPU reaches a fence signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Signals complete after `latency`
    Auto {
        /// Delay before each signal completes
        latency: Duration,
    },
    /// Signals complete only once released with [`HeadlessDevice::release_through`]
    Manual,
}

impl CompletionMode {
    /// Signals complete as soon as the worker reaches them
    pub const fn immediate() -> Self {
        Self::Auto {
            latency: Duration::ZERO,
        }
    }
}

/// Construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessDeviceDesc {
    /// Back buffers in the simulated display
    pub back_buffer_count: usize,
    /// Back buffer width
    pub width: u32,
    /// Back buffer height
    pub height: u32,
    /// Fence completion behaviour
    pub mode: CompletionMode,
    /// Back buffer handed out after each present
    pub order: BackBufferOrder,
}

impl HeadlessDeviceDesc {
    /// Immediate completion, round-robin back buffers
    pub const fn new(back_buffer_count: usize, width: u32, height: u32) -> Self {
        Self {
            back_buffer_count,
            width,
            height,
            mode: CompletionMode::immediate(),
            order: BackBufferOrder::RoundRobin,
        }
    }

    /// Mirror a render configuration
    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.frame_count, config.width, config.height)
            .with_mode(CompletionMode::Auto {
                latency: Duration::from_millis(config.headless.latency_ms),
            })
            .with_order(config.headless.back_buffer_order.clone())
    }

    /// Set the completion mode
    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the back buffer order
    pub fn with_order(mut self, order: BackBufferOrder) -> Self {
        self.order = order;
        self
    }
}

/// Kind of CPU/GPU race detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HazardKind {
    /// CPU wrote upload memory that in-flight work reads
    CpuWriteInFlight,
    /// A buffer was released while in-flight work references it
    BufferReleasedInFlight,
    /// Command memory was reset while in-flight work was recorded from it
    AllocatorResetInFlight,
}

/// A recorded CPU/GPU race
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hazard {
    /// What happened
    pub kind: HazardKind,
    /// Raw buffer or allocator handle
    pub resource: u64,
    /// Fence value the resource was busy until; `None` if not yet signalled
    pub busy_until: Option<u64>,
    /// Completed fence value at the time
    pub completed: u64,
}

struct BufferRecord {
    data: Vec<u8>,
    residency: Residency,
    usage: BufferUsage,
    state: ResourceState,
    address: u64,
    label: &'static str,
    released: bool,
}

struct InFlightRange {
    range: BufferRange,
    busy_until: u64,
}

struct PipelineRecord {
    identifiers: HashMap<String, ShaderIdentifier>,
    ray_generation: ShaderIdentifier,
}

enum Job {
    Execute(Vec<GpuCommand>),
    Signal(u64),
}

struct State {
    buffers: HashMap<BufferId, BufferRecord>,
    next_buffer: u64,
    next_address: u64,
    allocators: HashMap<AllocatorId, u64>,
    next_allocator: u64,
    pipelines: HashMap<PipelineId, PipelineRecord>,
    next_pipeline: u64,
    in_flight: Vec<InFlightRange>,
    last_signaled: u64,
    completed: u64,
    released_through: u64,
    lost: Option<String>,
    hazards: Vec<Hazard>,
    back_buffers: Vec<Vec<u8>>,
    current_back_buffer: usize,
    present_count: u64,
    executed_batches: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`GpuDevice`] backed by a worker thread and host memory
pub struct HeadlessDevice {
    shared: Arc<Shared>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Option<JoinHandle<()>>,
    limits: DeviceLimits,
    order: BackBufferOrder,
}

impl HeadlessDevice {
    /// Start the worker thread
    pub fn new(desc: HeadlessDeviceDesc) -> Self {
        let pixels = desc.width as usize * desc.height as usize * 4;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffers: HashMap::new(),
                next_buffer: 1,
                next_address: ADDRESS_BASE,
                allocators: HashMap::new(),
                next_allocator: 1,
                pipelines: HashMap::new(),
                next_pipeline: 1,
                in_flight: Vec::new(),
                last_signaled: 0,
                completed: 0,
                released_through: 0,
                lost: None,
                hazards: Vec::new(),
                back_buffers: vec![vec![0; pixels]; desc.back_buffer_count],
                current_back_buffer: 0,
                present_count: 0,
                executed_batches: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let mode = desc.mode;
        let worker = std::thread::Builder::new()
            .name("headless-gpu".to_string())
            .spawn(move || run_queue(&worker_shared, &receiver, mode));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("Failed to start headless queue: {err}");
                shared.lock().lost = Some(format!("queue thread failed to start: {err}"));
                None
            }
        };

        log::info!(
            "Headless device: {} back buffers of {}x{}, {:?}",
            desc.back_buffer_count,
            desc.width,
            desc.height,
            desc.mode
        );

        Self {
            shared,
            jobs: Mutex::new(Some(sender)),
            worker,
            limits: DeviceLimits::standard(desc.back_buffer_count),
            order: desc.order,
        }
    }

    /// Immediate completion and round-robin presentation
    pub fn with_defaults(back_buffer_count: usize, width: u32, height: u32) -> Self {
        Self::new(HeadlessDeviceDesc::new(back_buffer_count, width, height))
    }

    /// Let signals up to and including `value` complete ([`CompletionMode::Manual`])
    pub fn release_through(&self, value: u64) {
        let mut state = self.shared.lock();
        state.released_through = state.released_through.max(value);
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Races detected so far
    pub fn hazards(&self) -> Vec<Hazard> {
        self.shared.lock().hazards.clone()
    }

    /// Command lists the worker has executed
    pub fn executed_batches(&self) -> u64 {
        self.shared.lock().executed_batches
    }

    /// Pixels of a back buffer, RGBA8
    pub fn back_buffer_contents(&self, index: usize) -> Option<Vec<u8>> {
        self.shared.lock().back_buffers.get(index).cloned()
    }

    /// Why the device was removed, if it was
    pub fn device_lost(&self) -> Option<String> {
        self.shared.lock().lost.clone()
    }

    /// Mark the device removed, as a driver reset would
    pub fn remove_device(&self, reason: impl Into<String>) {
        let mut state = self.shared.lock();
        state.lost.get_or_insert_with(|| reason.into());
        drop(state);
        self.shared.changed.notify_all();
    }

    fn send(&self, job: Job) -> GpuResult<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.as_ref()
            .ok_or_else(|| GpuError::SubmissionFailed("queue is shut down".to_string()))?
            .send(job)
            .map_err(|_| GpuError::SubmissionFailed("queue thread has stopped".to_string()))
    }

    fn record_hazard(state: &mut State, kind: HazardKind, resource: u64, busy_until: u64) {
        let busy_until = (busy_until != UNSIGNALED).then_some(busy_until);
        log::warn!(
            "{kind:?} on resource {resource}: busy until {busy_until:?}, completed {}",
            state.completed
        );
        let completed = state.completed;
        state.hazards.push(Hazard {
            kind,
            resource,
            busy_until,
            completed,
        });
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.changed.notify_all();
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Headless queue thread panicked");
            }
        }
    }
}

fn run_queue(shared: &Shared, jobs: &Receiver<Job>, mode: CompletionMode) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Execute(commands) => {
                let mut state = shared.lock();
                if state.shutdown {
                    return;
                }
                if state.lost.is_some() {
                    continue;
                }
                for command in &commands {
                    if let Err(reason) = run_guarded(|| state.apply(command)) {
                        log::error!("Device removed: {reason}");
                        state.lost = Some(reason);
                        shared.changed.notify_all();
                        break;
                    }
                }
                state.executed_batches += 1;
            }
            Job::Signal(value) => {
                match mode {
                    CompletionMode::Auto { latency } => {
                        if !latency.is_zero() {
                            std::thread::sleep(latency);
                        }
                    }
                    CompletionMode::Manual => {
                        let mut state = shared.lock();
                        while state.released_through < value && !state.shutdown {
                            state = shared
                                .changed
                                .wait(state)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                    }
                }
                let mut state = shared.lock();
                if state.shutdown {
                    return;
                }
                state.complete(value);
                drop(state);
                shared.changed.notify_all();
            }
        }
    }
}

/// Run one command on the queue thread, turning a panic into a device-removal reason
fn run_guarded(apply: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    match std::panic::catch_unwind(AssertUnwindSafe(apply)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("queue thread panicked: {message}"))
        }
    }
}

fn identifier_for(pipeline: PipelineId, export: &str) -> ShaderIdentifier {
    let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE];
    for (lane, chunk) in bytes.chunks_exact_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        pipeline.0.hash(&mut hasher);
        export.hash(&mut hasher);
        lane.hash(&mut hasher);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    ShaderIdentifier(bytes)
}

fn color_to_rgba8(color: [f32; 4]) -> [u8; 4] {
    color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8)
}

impl State {
    fn live_buffer(&self, id: BufferId) -> GpuResult<&BufferRecord> {
        self.buffers
            .get(&id)
            .filter(|record| !record.released)
            .ok_or(GpuError::UnknownResource { id: id.0 })
    }

    fn busy_until(&self, range: &BufferRange) -> Option<u64> {
        self.in_flight
            .iter()
            .filter(|entry| entry.busy_until > self.completed && entry.range.overlaps(range))
            .map(|entry| entry.busy_until)
            .max()
    }

    fn complete(&mut self, value: u64) {
        self.completed = self.completed.max(value);
        let completed = self.completed;
        self.in_flight.retain(|entry| entry.busy_until > completed);

        let in_flight = &self.in_flight;
        self.buffers.retain(|id, record| {
            !record.released || in_flight.iter().any(|entry| entry.range.buffer == *id)
        });
        log::trace!("Headless fence reached {completed}");
    }

    fn referenced_ranges(&self, commands: &[GpuCommand]) -> GpuResult<Vec<BufferRange>> {
        let whole = |id: BufferId| -> GpuResult<BufferRange> {
            let record = self.live_buffer(id)?;
            Ok(BufferRange {
                buffer: id,
                offset: 0,
                size: record.data.len() as u64,
            })
        };

        let mut ranges = Vec::new();
        for command in commands {
            match command {
                GpuCommand::CopyBuffer { source, destination } => {
                    ranges.extend([*source, *destination]);
                }
                GpuCommand::Transition { buffer, .. } | GpuCommand::UavBarrier { buffer } => {
                    ranges.push(whole(*buffer)?);
                }
                GpuCommand::BuildAccelerationStructure {
                    inputs,
                    scratch,
                    destination,
                } => {
                    match inputs {
                        AccelerationStructureInputs::BottomLevel { geometries } => {
                            for geometry in geometries {
                                ranges.extend([geometry.vertices, geometry.indices]);
                            }
                        }
                        AccelerationStructureInputs::TopLevel { instances, .. } => {
                            ranges.push(*instances);
                        }
                    }
                    ranges.extend([*scratch, *destination]);
                }
                GpuCommand::DispatchRays(desc) => {
                    ranges.extend([desc.ray_generation.range, desc.miss.range, desc.hit_group.range]);
                    ranges.extend(desc.bindings.iter().map(|binding| binding.range));
                }
                GpuCommand::ClearBackBuffer { .. } => {}
                GpuCommand::CopyBufferToBackBuffer { source, .. } => ranges.push(*source),
            }
        }

        for range in &ranges {
            let record = self.live_buffer(range.buffer)?;
            if range.offset + range.size > record.data.len() as u64 {
                return Err(GpuError::contract(format!(
                    "range {}+{} exceeds '{}'",
                    range.offset, range.size, record.label
                )));
            }
        }
        Ok(ranges)
    }

    // Everything below runs on the queue thread. Errors are device-removal reasons.

    fn record(&self, id: BufferId) -> Result<&BufferRecord, String> {
        self.buffers
            .get(&id)
            .ok_or_else(|| format!("buffer {} does not exist", id.0))
    }

    fn require(&self, id: BufferId, access: ResourceState, use_: &str) -> Result<(), String> {
        let record = self.record(id)?;
        if record.state.permits(access) {
            Ok(())
        } else {
            Err(format!(
                "{use_} needs '{}' in {access:?} but it is in {:?}",
                record.label, record.state
            ))
        }
    }

    fn require_readable(&self, id: BufferId, use_: &str) -> Result<(), String> {
        let record = self.record(id)?;
        if record.state.is_read_only() {
            Ok(())
        } else {
            Err(format!("{use_} reads '{}' while it is in {:?}", record.label, record.state))
        }
    }

    fn bytes(&self, range: BufferRange) -> Result<&[u8], String> {
        let record = self.record(range.buffer)?;
        let start = range.offset as usize;
        record
            .data
            .get(start..start + range.size as usize)
            .ok_or_else(|| format!("range {}+{} outside '{}'", range.offset, range.size, record.label))
    }

    fn bytes_mut(&mut self, range: BufferRange) -> Result<&mut [u8], String> {
        let record = self
            .buffers
            .get_mut(&range.buffer)
            .ok_or_else(|| format!("buffer {} does not exist", range.buffer.0))?;
        let start = range.offset as usize;
        let label = record.label;
        record
            .data
            .get_mut(start..start + range.size as usize)
            .ok_or_else(|| format!("range {}+{} outside '{label}'", range.offset, range.size))
    }

    fn resolve_address(&self, address: u64) -> Option<(BufferId, u64)> {
        self.buffers.iter().find_map(|(id, record)| {
            let end = record.address + record.data.len() as u64;
            (!record.released && address >= record.address && address < end)
                .then(|| (*id, address - record.address))
        })
    }

    fn apply(&mut self, command: &GpuCommand) -> Result<(), String> {
        match command {
            GpuCommand::CopyBuffer { source, destination } => {
                self.require(source.buffer, ResourceState::COPY_SOURCE, "copy")?;
                self.require(destination.buffer, ResourceState::COPY_DEST, "copy")?;
                if source.size != destination.size {
                    return Err(format!("copy of {} bytes into {} bytes", source.size, destination.size));
                }
                let data = self.bytes(*source)?.to_vec();
                self.bytes_mut(*destination)?.copy_from_slice(&data);
            }
            GpuCommand::Transition { buffer, before, after } => {
                let record = self
                    .buffers
                    .get_mut(buffer)
                    .ok_or_else(|| format!("buffer {} does not exist", buffer.0))?;
                if record.state != *before {
                    return Err(format!(
                        "barrier on '{}' expects {before:?} but it is in {:?}",
                        record.label, record.state
                    ));
                }
                record.state = *after;
            }
            GpuCommand::UavBarrier { buffer } => {
                self.record(*buffer)?;
            }
            GpuCommand::BuildAccelerationStructure {
                inputs,
                scratch,
                destination,
            } => self.build(inputs, *scratch, *destination)?,
            GpuCommand::DispatchRays(desc) => self.dispatch(desc)?,
            GpuCommand::ClearBackBuffer { index, color } => {
                let pixel = color_to_rgba8(*color);
                let target = self
                    .back_buffers
                    .get_mut(*index)
                    .ok_or_else(|| format!("back buffer {index} does not exist"))?;
                for chunk in target.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&pixel);
                }
            }
            GpuCommand::CopyBufferToBackBuffer { source, index } => {
                self.require(source.buffer, ResourceState::COPY_SOURCE, "present copy")?;
                let data = self.bytes(*source)?.to_vec();
                let target = self
                    .back_buffers
                    .get_mut(*index)
                    .ok_or_else(|| format!("back buffer {index} does not exist"))?;
                if data.len() != target.len() {
                    return Err(format!(
                        "{} bytes copied into a {}-byte back buffer",
                        data.len(),
                        target.len()
                    ));
                }
                target.copy_from_slice(&data);
            }
        }
        Ok(())
    }

    fn build(
        &mut self,
        inputs: &AccelerationStructureInputs,
        scratch: BufferRange,
        destination: BufferRange,
    ) -> Result<(), String> {
        self.require(scratch.buffer, ResourceState::UNORDERED_ACCESS, "build scratch")?;
        self.require(destination.buffer, ResourceState::ACCELERATION_STRUCTURE, "build result")?;
        let needed = prebuild(inputs).map_err(|err| err.to_string())?;
        if destination.size < needed.result_size || scratch.size < needed.scratch_size {
            return Err(format!(
                "build needs {} result / {} scratch bytes, got {} / {}",
                needed.result_size, needed.scratch_size, destination.size, scratch.size
            ));
        }

        let mut blob = Vec::new();
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                let mut min = [f32::MAX; 3];
                let mut max = [f32::MIN; 3];
                let mut triangles = 0u32;
                for geometry in geometries {
                    self.require_readable(geometry.vertices.buffer, "bottom-level build")?;
                    self.require_readable(geometry.indices.buffer, "bottom-level build")?;
                    let indices: Vec<u32> = self
                        .bytes(geometry.indices)?
                        .chunks_exact(4)
                        .take(geometry.index_count as usize)
                        .map(|chunk| bytemuck::pod_read_unaligned(chunk))
                        .collect();
                    if indices.len() != geometry.index_count as usize {
                        return Err(format!("index buffer holds fewer than {} indices", geometry.index_count));
                    }
                    let vertices = self.bytes(geometry.vertices)?;
                    for &index in &indices {
                        if index >= geometry.vertex_count {
                            return Err(format!("index {index} beyond {} vertices", geometry.vertex_count));
                        }
                        let start = index as usize * geometry.vertex_stride as usize;
                        let position: [f32; 3] = vertices
                            .get(start..start + 12)
                            .map(bytemuck::pod_read_unaligned)
                            .ok_or_else(|| format!("vertex {index} outside the vertex buffer"))?;
                        for axis in 0..3 {
                            min[axis] = min[axis].min(position[axis]);
                            max[axis] = max[axis].max(position[axis]);
                        }
                    }
                    triangles += geometry.triangle_count();
                }
                blob.extend_from_slice(BLAS_MAGIC);
                blob.extend_from_slice(&(geometries.len() as u32).to_le_bytes());
                blob.extend_from_slice(&triangles.to_le_bytes());
                blob.extend_from_slice(bytemuck::cast_slice(&min));
                blob.extend_from_slice(bytemuck::cast_slice(&max));
            }
            AccelerationStructureInputs::TopLevel {
                instances,
                instance_count,
            } => {
                self.require_readable(instances.buffer, "top-level build")?;
                let bytes = self.bytes(*instances)?;
                if (bytes.len() as u64) < u64::from(*instance_count) * INSTANCE_SIZE {
                    return Err(format!("instance buffer holds fewer than {instance_count} instances"));
                }
                blob.extend_from_slice(TLAS_MAGIC);
                blob.extend_from_slice(&instance_count.to_le_bytes());
                for (position, chunk) in bytes
                    .chunks_exact(INSTANCE_SIZE as usize)
                    .take(*instance_count as usize)
                    .enumerate()
                {
                    let instance: InstanceDesc = bytemuck::pod_read_unaligned(chunk);
                    let (buffer, offset) = self
                        .resolve_address(instance.acceleration_structure)
                        .ok_or_else(|| format!("instance {position} points at unmapped memory"))?;
                    let header = self.bytes(BufferRange { buffer, offset, size: 4 })?;
                    if header != BLAS_MAGIC {
                        return Err(format!("instance {position} points at an unbuilt bottom-level structure"));
                    }
                    blob.extend_from_slice(&instance.acceleration_structure.to_le_bytes());
                }
            }
        }

        let size = blob.len() as u64;
        self.bytes_mut(BufferRange {
            size,
            ..destination
        })?
        .copy_from_slice(&blob);
        Ok(())
    }

    fn check_records(&self, pipeline: &PipelineRecord, region: ShaderTableRegion, what: &str) -> Result<(), String> {
        let table = self.bytes(region.range)?;
        if region.stride == 0 {
            return if region.range.size == 0 {
                Ok(())
            } else {
                Err(format!("{what} region has zero stride"))
            };
        }
        for record in table.chunks(region.stride as usize) {
            let identifier = record
                .get(..SHADER_IDENTIFIER_SIZE)
                .ok_or_else(|| format!("{what} record shorter than an identifier"))?;
            if !pipeline.identifiers.values().any(|known| known.as_bytes() == identifier) {
                return Err(format!("{what} record carries an identifier the pipeline never issued"));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, desc: &DispatchRaysDesc) -> Result<(), String> {
        let pipeline = self
            .pipelines
            .get(&desc.pipeline)
            .ok_or_else(|| format!("pipeline {} does not exist", desc.pipeline.0))?;

        for region in [desc.ray_generation, desc.miss, desc.hit_group] {
            self.require_readable(region.range.buffer, "shader table")?;
        }
        let raygen = self.bytes(desc.ray_generation.range)?;
        if raygen.get(..SHADER_IDENTIFIER_SIZE) != Some(pipeline.ray_generation.as_bytes()) {
            return Err("ray-generation record does not hold the pipeline's ray-generation program".to_string());
        }
        self.check_records(pipeline, desc.miss, "miss")?;
        self.check_records(pipeline, desc.hit_group, "hit group")?;

        for binding in &desc.bindings {
            self.require(binding.range.buffer, binding.access, "dispatch")?;
            if binding.access == ResourceState::ACCELERATION_STRUCTURE {
                let header = self.bytes(BufferRange {
                    size: 4,
                    ..binding.range
                })?;
                if header != TLAS_MAGIC {
                    return Err("dispatch traces an unbuilt top-level structure".to_string());
                }
            }
        }

        let (width, height) = (desc.width.max(1), desc.height.max(1));
        for binding in desc
            .bindings
            .iter()
            .filter(|binding| binding.access == ResourceState::UNORDERED_ACCESS)
        {
            let output = self.bytes_mut(binding.range)?;
            for (pixel, chunk) in output.chunks_exact_mut(4).enumerate() {
                let x = (pixel as u32 % width) as f32 / (width.max(2) - 1) as f32;
                let y = (pixel as u32 / width).min(height - 1) as f32 / (height.max(2) - 1) as f32;
                chunk.copy_from_slice(&color_to_rgba8([x, y, 0.25, 1.0]));
            }
        }
        Ok(())
    }
}

fn prebuild(inputs: &AccelerationStructureInputs) -> GpuResult<PrebuildInfo> {
    let count = inputs.primitive_count();
    if count == 0 {
        return Err(GpuError::contract(format!("{:?} build over nothing", inputs.kind())));
    }
    Ok(match inputs.kind() {
        AccelerationStructureKind::BottomLevel => PrebuildInfo {
            result_size: 200 + 56 * count,
            scratch_size: 100 + 24 * count,
        },
        AccelerationStructureKind::TopLevel => PrebuildInfo {
            result_size: 120 + 64 * count,
            scratch_size: 72 + 16 * count,
        },
    })
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "Headless"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferId> {
        if desc.size > MAX_BUFFER_SIZE {
            return Err(GpuError::AllocationFailed {
                requested: desc.size,
                reason: format!("larger than the {MAX_BUFFER_SIZE}-byte headless heap"),
            });
        }
        desc.validate(self.limits.constant_buffer_alignment)?;

        let mut state = self.shared.lock();
        let id = BufferId(state.next_buffer);
        state.next_buffer += 1;
        let address = state.next_address;
        state.next_address += align_up(desc.size, ADDRESS_ALIGNMENT);
        state.buffers.insert(
            id,
            BufferRecord {
                data: vec![0; desc.size as usize],
                residency: desc.residency,
                usage: desc.usage,
                state: desc.initial_state,
                address,
                label: desc.label,
                released: false,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.shared.lock();
        let Some(size) = state.buffers.get(&buffer).map(|record| record.data.len() as u64) else {
            return;
        };
        let whole = BufferRange {
            buffer,
            offset: 0,
            size,
        };
        match state.busy_until(&whole) {
            Some(busy_until) => {
                Self::record_hazard(&mut state, HazardKind::BufferReleasedInFlight, buffer.0, busy_until);
                if let Some(record) = state.buffers.get_mut(&buffer) {
                    record.released = true;
                }
            }
            None => {
                state.buffers.remove(&buffer);
            }
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut state = self.shared.lock();
        let record = state.live_buffer(buffer)?;
        if record.residency != Residency::Upload {
            return Err(GpuError::contract(format!("'{}' is not CPU-writable", record.label)));
        }
        let end = offset as usize + data.len();
        if end > record.data.len() {
            return Err(GpuError::contract(format!("write past the end of '{}'", record.label)));
        }

        let range = BufferRange {
            buffer,
            offset,
            size: data.len() as u64,
        };
        if let Some(busy_until) = state.busy_until(&range) {
            Self::record_hazard(&mut state, HazardKind::CpuWriteInFlight, buffer.0, busy_until);
        }
        if let Some(record) = state.buffers.get_mut(&buffer) {
            record.data[offset as usize..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let state = self.shared.lock();
        let record = state.live_buffer(buffer)?;
        record
            .data
            .get(offset as usize..(offset + len) as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GpuError::contract(format!("read past the end of '{}'", record.label)))
    }

    fn buffer_address(&self, buffer: BufferId) -> GpuResult<u64> {
        Ok(self.shared.lock().live_buffer(buffer)?.address)
    }

    fn create_command_allocator(&self) -> GpuResult<AllocatorId> {
        let mut state = self.shared.lock();
        let id = AllocatorId(state.next_allocator);
        state.next_allocator += 1;
        state.allocators.insert(id, 0);
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> GpuResult<()> {
        let mut state = self.shared.lock();
        let busy_until = *state
            .allocators
            .get(&allocator)
            .ok_or(GpuError::UnknownResource { id: allocator.0 })?;
        if busy_until > state.completed {
            Self::record_hazard(&mut state, HazardKind::AllocatorResetInFlight, allocator.0, busy_until);
            return Err(GpuError::contract(format!(
                "command allocator {} reset while the GPU may still read it",
                allocator.0
            )));
        }
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        self.shared.lock().allocators.remove(&allocator);
    }

    fn execute(&self, allocator: AllocatorId, commands: &[GpuCommand]) -> GpuResult<()> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.lost {
            return Err(GpuError::DeviceRemoved(reason.clone()));
        }
        if !state.allocators.contains_key(&allocator) {
            return Err(GpuError::UnknownResource { id: allocator.0 });
        }
        let ranges = state.referenced_ranges(commands)?;
        state.in_flight.extend(ranges.into_iter().map(|range| InFlightRange {
            range,
            busy_until: UNSIGNALED,
        }));
        state.allocators.insert(allocator, UNSIGNALED);
        drop(state);

        log::trace!("Headless execute: {} commands", commands.len());
        self.send(Job::Execute(commands.to_vec()))
    }

    fn signal(&self, value: u64) -> GpuResult<()> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.lost {
            return Err(GpuError::DeviceRemoved(reason.clone()));
        }
        if value <= state.last_signaled {
            return Err(GpuError::contract(format!(
                "fence value {value} does not increase {}",
                state.last_signaled
            )));
        }
        for entry in state.in_flight.iter_mut().filter(|entry| entry.busy_until == UNSIGNALED) {
            entry.busy_until = value;
        }
        for busy_until in state.allocators.values_mut().filter(|busy| **busy == UNSIGNALED) {
            *busy_until = value;
        }
        state.last_signaled = value;
        drop(state);

        self.send(Job::Signal(value))
    }

    fn completed_value(&self) -> GpuResult<u64> {
        let state = self.shared.lock();
        match &state.lost {
            Some(reason) => Err(GpuError::DeviceRemoved(reason.clone())),
            None => Ok(state.completed),
        }
    }

    fn wait_for_value(&self, value: u64, timeout: Duration) -> GpuResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(reason) = &state.lost {
                return Err(GpuError::DeviceRemoved(reason.clone()));
            }
            if state.completed >= value {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GpuError::WaitTimeout {
                    value,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn acceleration_structure_prebuild(&self, inputs: &AccelerationStructureInputs) -> GpuResult<PrebuildInfo> {
        if let AccelerationStructureInputs::BottomLevel { geometries } = inputs {
            if let Some(geometry) = geometries.iter().find(|g| g.vertex_stride < 12) {
                return Err(GpuError::contract(format!(
                    "vertex stride {} cannot hold a position",
                    geometry.vertex_stride
                )));
            }
        }
        prebuild(inputs)
    }

    fn acceleration_structure_address(
        &self,
        result: BufferRange,
        kind: AccelerationStructureKind,
    ) -> GpuResult<u64> {
        let state = self.shared.lock();
        let record = state.live_buffer(result.buffer)?;
        if !record.usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
            return Err(GpuError::contract(format!(
                "'{}' cannot hold a {kind:?} structure",
                record.label
            )));
        }
        Ok(record.address + result.offset)
    }

    fn create_raytracing_pipeline(&self, desc: &RaytracingPipelineDesc) -> GpuResult<PipelineId> {
        desc.validate()?;
        let mut state = self.shared.lock();
        let id = PipelineId(state.next_pipeline);
        state.next_pipeline += 1;
        let identifiers = desc
            .export_names()
            .map(|name| (name.to_string(), identifier_for(id, name)))
            .collect();
        state.pipelines.insert(
            id,
            PipelineRecord {
                identifiers,
                ray_generation: identifier_for(id, &desc.ray_generation.export),
            },
        );
        Ok(id)
    }

    fn destroy_raytracing_pipeline(&self, pipeline: PipelineId) {
        self.shared.lock().pipelines.remove(&pipeline);
    }

    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier> {
        self.shared
            .lock()
            .pipelines
            .get(&pipeline)
            .and_then(|record| record.identifiers.get(export).copied())
    }

    fn present(&self) -> GpuResult<()> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.lost {
            return Err(GpuError::DeviceRemoved(reason.clone()));
        }
        let count = state.back_buffers.len().max(1);
        state.current_back_buffer = match &self.order {
            BackBufferOrder::RoundRobin => (state.current_back_buffer + 1) % count,
            BackBufferOrder::Sequence(sequence) if !sequence.is_empty() => {
                sequence[(state.present_count % sequence.len() as u64) as usize] % count
            }
            BackBufferOrder::Sequence(_) => 0,
        };
        state.present_count += 1;
        Ok(())
    }

    fn current_back_buffer_index(&self) -> usize {
        self.shared.lock().current_back_buffer
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferBinding;

    fn upload(device: &HeadlessDevice, size: u64) -> BufferId {
        device
            .create_buffer(&BufferDesc::upload(size, BufferUsage::COPY_SOURCE, "upload"))
            .unwrap()
    }

    fn resident(device: &HeadlessDevice, size: u64, state: ResourceState) -> BufferId {
        device
            .create_buffer(&BufferDesc::resident(size, BufferUsage::STORAGE, state, "resident"))
            .unwrap()
    }

    fn range(buffer: BufferId, size: u64) -> BufferRange {
        BufferRange {
            buffer,
            offset: 0,
            size,
        }
    }

    #[test]
    fn test_addresses_are_aligned_and_distinct() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let a = upload(&device, 10);
        let b = upload(&device, 300);
        let a_address = device.buffer_address(a).unwrap();
        let b_address = device.buffer_address(b).unwrap();
        assert_eq!(a_address, ADDRESS_BASE);
        assert_eq!(b_address, ADDRESS_BASE + 256);
        assert_eq!(b_address % 256, 0);
    }

    #[test]
    fn test_fence_completes_in_order() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let allocator = device.create_command_allocator().unwrap();
        device.execute(allocator, &[]).unwrap();
        device.signal(1).unwrap();
        device.signal(2).unwrap();
        device.wait_for_value(2, Duration::from_secs(5)).unwrap();
        assert_eq!(device.completed_value().unwrap(), 2);
        assert_eq!(device.executed_batches(), 1);
        assert!(device.signal(2).is_err());
    }

    #[test]
    fn test_manual_mode_holds_signals() {
        let device = HeadlessDevice::new(HeadlessDeviceDesc::new(3, 4, 4).with_mode(CompletionMode::Manual));
        device.signal(1).unwrap();
        device.signal(2).unwrap();
        assert!(matches!(
            device.wait_for_value(1, Duration::from_millis(20)),
            Err(GpuError::WaitTimeout { value: 1, .. })
        ));

        device.release_through(1);
        device.wait_for_value(1, Duration::from_secs(5)).unwrap();
        assert_eq!(device.completed_value().unwrap(), 1);
    }

    #[test]
    fn test_wrong_barrier_removes_device() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let allocator = device.create_command_allocator().unwrap();
        let buffer = resident(&device, 16, ResourceState::COPY_DEST);

        let commands = [GpuCommand::Transition {
            buffer,
            before: ResourceState::SHADER_RESOURCE,
            after: ResourceState::COPY_DEST,
        }];
        device.execute(allocator, &commands).unwrap();
        device.signal(1).unwrap();

        let err = device.wait_for_value(1, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, GpuError::DeviceRemoved(_)));
        assert!(device.device_lost().unwrap().contains("SHADER_RESOURCE"));
        assert!(matches!(device.execute(allocator, &[]), Err(GpuError::DeviceRemoved(_))));
    }

    #[test]
    fn test_cpu_write_to_in_flight_range_is_a_hazard() {
        let device = HeadlessDevice::new(HeadlessDeviceDesc::new(3, 4, 4).with_mode(CompletionMode::Manual));
        let allocator = device.create_command_allocator().unwrap();
        let constants = device
            .create_buffer(&BufferDesc::upload(512, BufferUsage::CONSTANT, "constants"))
            .unwrap();
        let target = resident(&device, 256, ResourceState::COPY_DEST);

        let source = BufferRange {
            buffer: constants,
            offset: 256,
            size: 256,
        };
        device
            .execute(allocator, &[GpuCommand::CopyBuffer { source, destination: range(target, 256) }])
            .unwrap();
        device.signal(1).unwrap();

        device.write_buffer(constants, 0, &[1; 256]).unwrap();
        assert!(device.hazards().is_empty());

        device.write_buffer(constants, 256, &[1; 16]).unwrap();
        let hazards = device.hazards();
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::CpuWriteInFlight);
        assert_eq!(hazards[0].busy_until, Some(1));

        device.release_through(1);
        device.wait_for_value(1, Duration::from_secs(5)).unwrap();
        device.write_buffer(constants, 256, &[2; 16]).unwrap();
        assert_eq!(device.hazards().len(), 1);
    }

    #[test]
    fn test_release_and_reset_in_flight_are_hazards() {
        let device = HeadlessDevice::new(HeadlessDeviceDesc::new(3, 4, 4).with_mode(CompletionMode::Manual));
        let allocator = device.create_command_allocator().unwrap();
        let staging = upload(&device, 64);
        let target = resident(&device, 64, ResourceState::COPY_DEST);
        device
            .execute(
                allocator,
                &[GpuCommand::CopyBuffer {
                    source: range(staging, 64),
                    destination: range(target, 64),
                }],
            )
            .unwrap();
        device.signal(1).unwrap();

        assert!(matches!(
            device.reset_command_allocator(allocator),
            Err(GpuError::ContractViolation(_))
        ));
        device.destroy_buffer(staging);
        let kinds: Vec<_> = device.hazards().iter().map(|hazard| hazard.kind).collect();
        assert_eq!(
            kinds,
            vec![HazardKind::AllocatorResetInFlight, HazardKind::BufferReleasedInFlight]
        );

        device.release_through(1);
        device.wait_for_value(1, Duration::from_secs(5)).unwrap();
        assert_eq!(device.read_buffer(target, 0, 4).unwrap(), vec![0; 4]);
        device.reset_command_allocator(allocator).unwrap();
        assert!(matches!(device.buffer_address(staging), Err(GpuError::UnknownResource { .. })));
    }

    #[test]
    fn test_copy_and_present_fill_back_buffer() {
        let device = HeadlessDevice::with_defaults(2, 2, 1);
        let allocator = device.create_command_allocator().unwrap();
        let pixels = upload(&device, 8);
        device.write_buffer(pixels, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        device
            .execute(
                allocator,
                &[
                    GpuCommand::ClearBackBuffer { index: 0, color: [1.0, 0.0, 0.0, 1.0] },
                    GpuCommand::CopyBufferToBackBuffer { source: range(pixels, 8), index: 1 },
                ],
            )
            .unwrap();
        device.signal(1).unwrap();
        device.wait_for_value(1, Duration::from_secs(5)).unwrap();

        assert_eq!(device.back_buffer_contents(0).unwrap(), vec![255, 0, 0, 255, 255, 0, 0, 255]);
        assert_eq!(device.back_buffer_contents(1).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(device.current_back_buffer_index(), 0);
        device.present().unwrap();
        assert_eq!(device.current_back_buffer_index(), 1);
        device.present().unwrap();
        assert_eq!(device.current_back_buffer_index(), 0);
    }

    #[test]
    fn test_dispatch_rejects_foreign_ray_generation_record() {
        let device = HeadlessDevice::with_defaults(3, 2, 2);
        let allocator = device.create_command_allocator().unwrap();
        let pipeline = device
            .create_raytracing_pipeline(&crate::shader::tests::pipeline_desc())
            .unwrap();
        let table = device
            .create_buffer(&BufferDesc::upload(64, BufferUsage::SHADER_TABLE, "table"))
            .unwrap();
        let output = resident(&device, 16, ResourceState::UNORDERED_ACCESS);
        let miss = device.shader_identifier(pipeline, "Miss").unwrap();
        device.write_buffer(table, 0, miss.as_bytes()).unwrap();

        let region = ShaderTableRegion {
            range: range(table, 32),
            stride: 32,
        };
        let desc = DispatchRaysDesc {
            pipeline,
            ray_generation: region,
            miss: region,
            hit_group: ShaderTableRegion {
                range: BufferRange { buffer: table, offset: 32, size: 0 },
                stride: 32,
            },
            width: 2,
            height: 2,
            bindings: vec![BufferBinding {
                range: range(output, 16),
                access: ResourceState::UNORDERED_ACCESS,
            }],
        };
        device.execute(allocator, &[GpuCommand::DispatchRays(desc)]).unwrap();
        device.signal(1).unwrap();

        assert!(matches!(
            device.wait_for_value(1, Duration::from_secs(5)),
            Err(GpuError::DeviceRemoved(reason)) if reason.contains("ray-generation")
        ));
    }

    #[test]
    fn test_resolve_address_ignores_buffers_above_target() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let first = upload(&device, 256);
        let target = upload(&device, 512);
        for _ in 0..8 {
            upload(&device, 256);
        }
        let address = device.buffer_address(target).unwrap() + 64;

        let state = device.shared.lock();
        assert_eq!(state.resolve_address(address), Some((target, 64)));
        assert_eq!(state.resolve_address(ADDRESS_BASE), Some((first, 0)));
        assert_eq!(state.resolve_address(ADDRESS_BASE - 1), None);
        assert_eq!(state.resolve_address(state.next_address), None);
    }

    #[test]
    fn test_top_level_over_later_allocated_bottom_level() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let allocator = device.create_command_allocator().unwrap();

        // Earlier allocations sit below the bottom level in the address space
        for _ in 0..4 {
            upload(&device, 256);
        }
        let vertices = device
            .create_buffer(&BufferDesc::upload(36, BufferUsage::BUILD_INPUT, "vertices"))
            .unwrap();
        let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        device.write_buffer(vertices, 0, bytemuck::cast_slice(&positions)).unwrap();
        let indices = device
            .create_buffer(&BufferDesc::upload(12, BufferUsage::BUILD_INPUT, "indices"))
            .unwrap();
        device.write_buffer(indices, 0, bytemuck::cast_slice(&[0u32, 1, 2])).unwrap();

        let structure = |name: &'static str| {
            device
                .create_buffer(&BufferDesc::resident(
                    256,
                    BufferUsage::ACCELERATION_STRUCTURE,
                    ResourceState::ACCELERATION_STRUCTURE,
                    name,
                ))
                .unwrap()
        };
        let blas_scratch = resident(&device, 256, ResourceState::UNORDERED_ACCESS);
        let blas = structure("bottom level");
        let blas_address = device
            .acceleration_structure_address(range(blas, 256), AccelerationStructureKind::BottomLevel)
            .unwrap();

        // Everything from here on lives above the bottom level
        for _ in 0..4 {
            upload(&device, 256);
        }
        let instances = device
            .create_buffer(&BufferDesc::upload(INSTANCE_SIZE, BufferUsage::BUILD_INPUT, "instances"))
            .unwrap();
        let instance = InstanceDesc::new(&nalgebra::Matrix4::identity(), 0, 0xFF, 0, 0, blas_address);
        device.write_buffer(instances, 0, bytemuck::bytes_of(&instance)).unwrap();
        let tlas_scratch = resident(&device, 256, ResourceState::UNORDERED_ACCESS);
        let tlas = structure("top level");

        let geometry = crate::device::TriangleGeometry {
            vertices: range(vertices, 36),
            vertex_count: 3,
            vertex_stride: 12,
            indices: range(indices, 12),
            index_count: 3,
            opaque: true,
        };
        let commands = [
            GpuCommand::BuildAccelerationStructure {
                inputs: AccelerationStructureInputs::BottomLevel { geometries: vec![geometry] },
                scratch: range(blas_scratch, 256),
                destination: range(blas, 256),
            },
            GpuCommand::UavBarrier { buffer: blas },
            GpuCommand::BuildAccelerationStructure {
                inputs: AccelerationStructureInputs::TopLevel {
                    instances: range(instances, INSTANCE_SIZE),
                    instance_count: 1,
                },
                scratch: range(tlas_scratch, 256),
                destination: range(tlas, 256),
            },
        ];
        device.execute(allocator, &commands).unwrap();
        device.signal(1).unwrap();
        device.wait_for_value(1, Duration::from_secs(5)).unwrap();

        assert!(device.device_lost().is_none());
        assert_eq!(device.read_buffer(tlas, 0, 4).unwrap(), TLAS_MAGIC.to_vec());
        let referenced = device.read_buffer(tlas, 8, 8).unwrap();
        assert_eq!(referenced, blas_address.to_le_bytes().to_vec());
    }

    #[test]
    fn test_panicking_command_becomes_removal_reason() {
        assert_eq!(run_guarded(|| Ok(())), Ok(()));
        assert_eq!(run_guarded(|| Err("bad barrier".to_string())), Err("bad barrier".to_string()));

        let reason = run_guarded(|| panic!("index out of range")).unwrap_err();
        assert!(reason.contains("panicked"));
        assert!(reason.contains("index out of range"));

        let count = 3;
        let reason = run_guarded(|| panic!("{count} buffers overlap")).unwrap_err();
        assert!(reason.contains("3 buffers overlap"));
    }

    #[test]
    fn test_prebuild_sizes_are_not_rounded() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let instances = AccelerationStructureInputs::TopLevel {
            instances: range(BufferId(0), 64),
            instance_count: 1,
        };
        let info = device.acceleration_structure_prebuild(&instances).unwrap();
        assert_eq!(info, PrebuildInfo { result_size: 184, scratch_size: 88 });
        let empty = AccelerationStructureInputs::BottomLevel { geometries: Vec::new() };
        assert!(device.acceleration_structure_prebuild(&empty).is_err());
    }

    #[test]
    fn test_oversized_buffer_fails_allocation() {
        let device = HeadlessDevice::with_defaults(3, 4, 4);
        let desc = BufferDesc::resident(MAX_BUFFER_SIZE + 1, BufferUsage::STORAGE, ResourceState::COPY_DEST, "huge");
        assert!(matches!(device.create_buffer(&desc), Err(GpuError::AllocationFailed { .. })));
    }
}
