// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The context binds one global region view, two channel buffers, two
//! notification events and the shared-config region into a single handle
//! with attach/detach lifetime tracking.
//!
//! Two transports exist:
//!
//! - **Named regions** (both platforms): every region has a well-known name
//!   derived from the product; the target creates and initializes them and
//!   then signals the target-ready event, which gates agent attach.
//! - **Anonymous descriptors** (Unix): the target creates nameless regions
//!   and pushes their descriptors to the agent's fd-exchange socket; the
//!   agent maps whatever arrives.
//!
//! Attach increments the shared `attached_processes_count`; the detacher
//! that brings it back to zero flips `cleanup_on_close` on every named
//! resource so the OS objects disappear with it. Detach never fails the
//! caller: errors on the exit path are logged and swallowed.

use crate::dispatch::GlobalDispatchTable;
use crate::error::MlosError;
use crate::messages::{RegisterSettingsAssemblyRequest, REGISTER_SETTINGS_ASSEMBLY_TYPE_INDEX};
use anyhow::Context as _;
use mlos_ipc::platform::{
    FileBackedHandle, MappedMem, NamedEvent, NamedShmHandle, ShmHandle,
};
use mlos_shm::channel::{ChannelError, SharedChannel};
use mlos_shm::dictionary::SharedConfigDictionary;
use mlos_shm::frame::ShmMessage;
use mlos_shm::layout::{
    attach_region_header, initialize_region_header, GlobalMemoryRegion, RegionTableEntry,
    RegionType,
};
use std::ffi::CString;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

#[cfg(unix)]
use anyhow::anyhow;
#[cfg(unix)]
use mlos_ipc::exchange::{FdExchangeClient, FdExchangeServer, DEFAULT_SOCKET_DIR};
#[cfg(unix)]
use std::os::unix::prelude::AsRawFd;
#[cfg(unix)]
use std::sync::Arc;
#[cfg(unix)]
use std::thread::JoinHandle;

/// Default product tag in the well-known object names.
pub const DEFAULT_PRODUCT: &str = "Mlos";

/// Default size of every shared region.
pub const DEFAULT_REGION_SIZE: usize = 65536;

/// Default slot count of the shared configuration dictionary.
pub const DEFAULT_DICTIONARY_SLOTS: u32 = 128;

/// Well-known object names.
pub mod names {
    pub fn global_region(product: &str) -> String {
        format!("Host_{product}.GlobalMemory")
    }

    pub fn control_channel_region(product: &str) -> String {
        format!("Host_{product}.ControlChannel")
    }

    pub fn feedback_channel_region(product: &str) -> String {
        format!("Host_{product}.FeedbackChannel")
    }

    pub fn shared_config_region(product: &str) -> String {
        format!("Host_{product}.Config.SharedMemory")
    }

    pub const CONTROL_CHANNEL_EVENT: &str = "ControlChannel_Event";
    pub const FEEDBACK_CHANNEL_EVENT: &str = "FeedbackChannel_Event";

    pub fn target_ready_event(product: &str) -> String {
        format!("{product}_Global")
    }
}

/// Construction parameters; `Default` matches the §external-interface
/// conventions of the product.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub product: String,
    pub region_size: usize,
    pub dictionary_slots: u32,
    /// Rendezvous directory of the anonymous transport.
    pub socket_dir: PathBuf,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            product: DEFAULT_PRODUCT.to_owned(),
            region_size: DEFAULT_REGION_SIZE,
            dictionary_slots: DEFAULT_DICTIONARY_SLOTS,
            #[cfg(unix)]
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            #[cfg(not(unix))]
            socket_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Agent,
}

/// Which transport bootstrapped this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTransport {
    NamedRegions,
    AnonymousFds,
}

enum MappedRegion {
    Named(MappedMem<NamedShmHandle>),
    #[cfg_attr(windows, allow(dead_code))]
    Anonymous(MappedMem<ShmHandle>),
}

impl MappedRegion {
    fn base_ptr(&self) -> NonNull<u8> {
        match self {
            MappedRegion::Named(mapped) => mapped.base_ptr(),
            MappedRegion::Anonymous(mapped) => mapped.base_ptr(),
        }
    }

    fn size(&self) -> usize {
        match self {
            MappedRegion::Named(mapped) => mapped.get_size(),
            MappedRegion::Anonymous(mapped) => mapped.get_size(),
        }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        match self {
            MappedRegion::Named(mapped) => mapped.as_slice_mut(),
            MappedRegion::Anonymous(mapped) => mapped.as_slice_mut(),
        }
    }

    fn set_cleanup_on_close(&mut self, cleanup: bool) {
        if let MappedRegion::Named(mapped) = self {
            mapped.set_cleanup_on_close(cleanup);
        }
    }
}

enum TransportState {
    Named,
    #[cfg(unix)]
    AnonymousTarget {
        _client: FdExchangeClient,
    },
    #[cfg(unix)]
    AnonymousAgent {
        server: Arc<FdExchangeServer>,
        acceptor: Option<JoinHandle<()>>,
    },
}

pub struct Context {
    role: Role,
    product: String,
    global_view: NonNull<GlobalMemoryRegion>,
    control: SharedChannel,
    feedback: SharedChannel,
    dictionary: SharedConfigDictionary,
    control_event: NamedEvent,
    feedback_event: NamedEvent,
    target_ready_event: Option<NamedEvent>,
    state: TransportState,
    global_region: MappedRegion,
    control_region: MappedRegion,
    feedback_region: MappedRegion,
    config_region: MappedRegion,
}

// SAFETY: the raw global-region pointer targets a shared mapping owned by
// this struct; all mutable shared state behind it is atomic.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

fn object_path(name: &str) -> anyhow::Result<CString> {
    Ok(CString::new(format!("/{name}"))?)
}

fn open_event(name: &str) -> anyhow::Result<NamedEvent> {
    NamedEvent::create_or_open(object_path(name)?)
        .with_context(|| format!("opening notification event {name}"))
}

impl Context {
    // -- Named-memory mode --------------------------------------------------

    /// Target side, named regions: create (or adopt) the four regions,
    /// write every header, then signal the target-ready event.
    pub fn create_target_named(options: &ContextOptions) -> anyhow::Result<Context> {
        let product = options.product.as_str();

        let mut global_region =
            create_named_region(&names::global_region(product), options.region_size)?;
        let mut control_region =
            create_named_region(&names::control_channel_region(product), options.region_size)?;
        let mut feedback_region =
            create_named_region(&names::feedback_channel_region(product), options.region_size)?;
        let mut config_region =
            create_named_region(&names::shared_config_region(product), options.region_size)?;

        // The names may be left over from a crashed target; the headers are
        // rewritten below, but the buffers have to lose any stale frames.
        control_region.as_slice_mut().fill(0);
        feedback_region.as_slice_mut().fill(0);
        config_region.as_slice_mut().fill(0);

        let table = [
            region_table_entry(&global_region, RegionType::Global, &names::global_region(product))?,
            region_table_entry(
                &control_region,
                RegionType::ControlChannel,
                &names::control_channel_region(product),
            )?,
            region_table_entry(
                &feedback_region,
                RegionType::FeedbackChannel,
                &names::feedback_channel_region(product),
            )?,
            region_table_entry(
                &config_region,
                RegionType::SharedConfig,
                &names::shared_config_region(product),
            )?,
        ];

        let global_view = unsafe {
            GlobalMemoryRegion::initialize(
                global_region.base_ptr(),
                global_region.size() as u64,
                &table,
            )?
        };
        let config_payload = unsafe {
            initialize_region_header(
                config_region.base_ptr(),
                RegionType::SharedConfig,
                config_region.size() as u64,
            )?
        };
        let dictionary =
            unsafe { SharedConfigDictionary::initialize(config_payload, options.dictionary_slots)? };

        let (control, feedback) =
            build_channels(global_view, &control_region, &feedback_region)?;

        let control_event = open_event(names::CONTROL_CHANNEL_EVENT)?;
        let feedback_event = open_event(names::FEEDBACK_CHANNEL_EVENT)?;
        let target_ready = open_event(&names::target_ready_event(product))?;

        global_view
            .header
            .attached_processes_count
            .fetch_add(1, Ordering::AcqRel);

        // Bootstrap succeeded: the names now live until the last detacher.
        global_region.set_cleanup_on_close(false);
        control_region.set_cleanup_on_close(false);
        feedback_region.set_cleanup_on_close(false);
        config_region.set_cleanup_on_close(false);

        target_ready.signal().context("signaling target-ready")?;
        info!(product, "target context ready (named regions)");

        Ok(Context {
            role: Role::Target,
            product: product.to_owned(),
            global_view: NonNull::from(global_view),
            control,
            feedback,
            dictionary,
            control_event,
            feedback_event,
            target_ready_event: Some(target_ready),
            state: TransportState::Named,
            global_region,
            control_region,
            feedback_region,
            config_region,
        })
    }

    /// Agent side, named regions: wait for the target-ready event, then
    /// open everything through the bootstrap table.
    pub fn attach_agent_named(options: &ContextOptions) -> anyhow::Result<Context> {
        let product = options.product.as_str();

        let target_ready = open_event(&names::target_ready_event(product))?;
        target_ready
            .wait()
            .context("waiting for the target-ready event")?;
        // Leave the latch set for the next attacher.
        target_ready.signal().ok();

        let global_region = open_named_region(&names::global_region(product))?;
        let global_view = unsafe {
            GlobalMemoryRegion::attach(global_region.base_ptr(), global_region.size() as u64)?
        };

        let control_region = open_table_region(global_view, RegionType::ControlChannel)?;
        let feedback_region = open_table_region(global_view, RegionType::FeedbackChannel)?;
        let config_region = open_table_region(global_view, RegionType::SharedConfig)?;

        let (_, config_payload) = unsafe {
            attach_region_header(
                config_region.base_ptr(),
                RegionType::SharedConfig,
                config_region.size() as u64,
            )?
        };
        let dictionary = unsafe { SharedConfigDictionary::attach(config_payload)? };

        let (control, feedback) =
            build_channels(global_view, &control_region, &feedback_region)?;
        // A previous agent may have died mid-dispatch.
        control.recover();
        feedback.recover();

        let control_event = open_event(names::CONTROL_CHANNEL_EVENT)?;
        let feedback_event = open_event(names::FEEDBACK_CHANNEL_EVENT)?;

        global_view
            .header
            .attached_processes_count
            .fetch_add(1, Ordering::AcqRel);
        info!(product, "agent context attached (named regions)");

        Ok(Context {
            role: Role::Agent,
            product: product.to_owned(),
            global_view: NonNull::from(global_view),
            control,
            feedback,
            dictionary,
            control_event,
            feedback_event,
            target_ready_event: Some(target_ready),
            state: TransportState::Named,
            global_region,
            control_region,
            feedback_region,
            config_region,
        })
    }

    // -- Anonymous-memory mode (Unix) ---------------------------------------

    /// Target side, anonymous regions: create descriptor-only regions,
    /// initialize them, and push every descriptor to the agent's exchange
    /// socket.
    #[cfg(unix)]
    pub fn create_target_anonymous(options: &ContextOptions) -> anyhow::Result<Context> {
        let product = options.product.as_str();

        let global_region = create_anonymous_region(options.region_size)?;
        let control_region = create_anonymous_region(options.region_size)?;
        let feedback_region = create_anonymous_region(options.region_size)?;
        let config_region = create_anonymous_region(options.region_size)?;

        // Anonymous mode has no names to bootstrap: the envelopes carry the
        // region identities instead.
        let global_view = unsafe {
            GlobalMemoryRegion::initialize(
                global_region.base_ptr(),
                global_region.size() as u64,
                &[],
            )?
        };
        let config_payload = unsafe {
            initialize_region_header(
                config_region.base_ptr(),
                RegionType::SharedConfig,
                config_region.size() as u64,
            )?
        };
        let dictionary =
            unsafe { SharedConfigDictionary::initialize(config_payload, options.dictionary_slots)? };

        let (control, feedback) =
            build_channels(global_view, &control_region, &feedback_region)?;

        let control_event = open_event(names::CONTROL_CHANNEL_EVENT)?;
        let feedback_event = open_event(names::FEEDBACK_CHANNEL_EVENT)?;

        global_view
            .header
            .attached_processes_count
            .fetch_add(1, Ordering::AcqRel);

        // The agent signals the rendezvous event once its exchange socket
        // is listening.
        let exchange_ready = open_event(&names::target_ready_event(product))?;
        exchange_ready
            .wait()
            .context("waiting for the agent's fd exchange socket")?;

        let mut client = FdExchangeClient::connect(&options.socket_dir)
            .context("connecting to the agent's fd exchange socket")?;
        for (region, region_type) in [
            (&global_region, RegionType::Global),
            (&control_region, RegionType::ControlChannel),
            (&feedback_region, RegionType::FeedbackChannel),
            (&config_region, RegionType::SharedConfig),
        ] {
            let fd = match region {
                MappedRegion::Anonymous(mapped) => {
                    mapped.memory().get_shm().descriptor().as_raw_fd()
                }
                MappedRegion::Named(_) => unreachable!("anonymous transport maps no names"),
            };
            client
                .send_region(region_type as u32, 0, region.size() as u64, fd)
                .with_context(|| format!("announcing region {region_type:?}"))?;
        }
        info!(product, "target context ready (anonymous regions)");

        Ok(Context {
            role: Role::Target,
            product: product.to_owned(),
            global_view: NonNull::from(global_view),
            control,
            feedback,
            dictionary,
            control_event,
            feedback_event,
            target_ready_event: Some(exchange_ready),
            state: TransportState::AnonymousTarget { _client: client },
            global_region,
            control_region,
            feedback_region,
            config_region,
        })
    }

    /// Agent side, anonymous regions: serve the exchange socket and map
    /// whatever the target sends. Blocks until all four regions arrived.
    #[cfg(unix)]
    pub fn attach_agent_anonymous(options: &ContextOptions) -> anyhow::Result<Context> {
        let product = options.product.as_str();

        let server = Arc::new(
            FdExchangeServer::bind(&options.socket_dir)
                .context("binding the fd exchange socket")?,
        );
        let acceptor = std::thread::Builder::new()
            .name("mlos-exchange-accept".into())
            .spawn({
                let server = server.clone();
                move || {
                    if let Err(err) = server.accept_one() {
                        debug!(%err, "fd exchange accept ended");
                    }
                }
            })?;

        // Tell a waiting target that the exchange socket is listening.
        let exchange_ready = open_event(&names::target_ready_event(product))?;
        exchange_ready.signal().context("signaling exchange-ready")?;

        let store = server.regions();
        let fetch = |region_type: RegionType| -> anyhow::Result<MappedRegion> {
            let stored = store
                .wait_for(region_type as u32, 0, None)
                .ok_or_else(|| anyhow!("fd exchange closed before {region_type:?} arrived"))?;
            Ok(MappedRegion::Anonymous(
                ShmHandle::from_handle(stored.handle, stored.size as usize)
                    .map()
                    .with_context(|| format!("mapping received region {region_type:?}"))?,
            ))
        };

        let global_region = fetch(RegionType::Global)?;
        let control_region = fetch(RegionType::ControlChannel)?;
        let feedback_region = fetch(RegionType::FeedbackChannel)?;
        let config_region = fetch(RegionType::SharedConfig)?;

        let global_view = unsafe {
            GlobalMemoryRegion::attach(global_region.base_ptr(), global_region.size() as u64)?
        };
        let (_, config_payload) = unsafe {
            attach_region_header(
                config_region.base_ptr(),
                RegionType::SharedConfig,
                config_region.size() as u64,
            )?
        };
        let dictionary = unsafe { SharedConfigDictionary::attach(config_payload)? };

        let (control, feedback) =
            build_channels(global_view, &control_region, &feedback_region)?;
        control.recover();
        feedback.recover();

        let control_event = open_event(names::CONTROL_CHANNEL_EVENT)?;
        let feedback_event = open_event(names::FEEDBACK_CHANNEL_EVENT)?;

        global_view
            .header
            .attached_processes_count
            .fetch_add(1, Ordering::AcqRel);
        info!(product, "agent context attached (anonymous regions)");

        Ok(Context {
            role: Role::Agent,
            product: product.to_owned(),
            global_view: NonNull::from(global_view),
            control,
            feedback,
            dictionary,
            control_event,
            feedback_event,
            target_ready_event: Some(exchange_ready),
            state: TransportState::AnonymousAgent {
                server,
                acceptor: Some(acceptor),
            },
            global_region,
            control_region,
            feedback_region,
            config_region,
        })
    }

    // -- Accessors ----------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn transport(&self) -> ContextTransport {
        match self.state {
            TransportState::Named => ContextTransport::NamedRegions,
            #[cfg(unix)]
            _ => ContextTransport::AnonymousFds,
        }
    }

    pub fn global(&self) -> &GlobalMemoryRegion {
        unsafe { self.global_view.as_ref() }
    }

    pub fn control_channel(&self) -> &SharedChannel {
        &self.control
    }

    pub fn feedback_channel(&self) -> &SharedChannel {
        &self.feedback
    }

    pub fn dictionary(&self) -> &SharedConfigDictionary {
        &self.dictionary
    }

    pub fn control_event(&self) -> &NamedEvent {
        &self.control_event
    }

    pub fn feedback_event(&self) -> &NamedEvent {
        &self.feedback_event
    }

    pub fn attached_processes(&self) -> u32 {
        self.global()
            .header
            .attached_processes_count
            .load(Ordering::Acquire)
    }

    // -- Messaging ----------------------------------------------------------

    pub fn send_control<M: ShmMessage>(
        &self,
        type_index: u32,
        message: &M,
    ) -> Result<(), ChannelError> {
        self.control
            .send_frame(type_index, M::TYPE_HASH, &message.to_bytes(), &self.control_event)
    }

    pub fn send_feedback<M: ShmMessage>(
        &self,
        type_index: u32,
        message: &M,
    ) -> Result<(), ChannelError> {
        self.feedback.send_frame(
            type_index,
            M::TYPE_HASH,
            &message.to_bytes(),
            &self.feedback_event,
        )
    }

    /// Announces another settings registry: bumps the shared counter and
    /// sends the in-band registration message so the agent can extend its
    /// dispatch table. Returns the announcement ordinal.
    pub fn register_settings_assembly(&self, registry_name: &str) -> Result<u32, ChannelError> {
        let assembly_index = self
            .global()
            .header
            .registered_settings_assembly_count
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        let request = RegisterSettingsAssemblyRequest {
            assembly_index,
            registry_name: registry_name.to_owned(),
        };
        self.send_control(REGISTER_SETTINGS_ASSEMBLY_TYPE_INDEX, &request)?;
        Ok(assembly_index)
    }

    /// Drains the control channel through `table` until the channel is
    /// terminated.
    pub fn run_control_reader(&self, table: &GlobalDispatchTable) -> Result<(), MlosError> {
        run_reader(&self.control, &self.control_event, table)
    }

    /// Drains the feedback channel through `table` until the channel is
    /// terminated.
    pub fn run_feedback_reader(&self, table: &GlobalDispatchTable) -> Result<(), MlosError> {
        run_reader(&self.feedback, &self.feedback_event, table)
    }

    pub fn terminate_control_channel(&self) {
        self.control.terminate(&self.control_event);
    }

    pub fn terminate_feedback_channel(&self) {
        self.feedback.terminate(&self.feedback_event);
    }
}

fn run_reader(
    channel: &SharedChannel,
    event: &NamedEvent,
    table: &GlobalDispatchTable,
) -> Result<(), MlosError> {
    let reader = channel.reader();
    loop {
        let frame = match reader.receive(event) {
            Ok(frame) => frame,
            Err(ChannelError::Aborted) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        table.dispatch(&frame.as_view())?;
        // The frame completes on drop: payload zeroed, slot reclaimable.
    }
}

fn build_channels(
    global_view: &GlobalMemoryRegion,
    control_region: &MappedRegion,
    feedback_region: &MappedRegion,
) -> Result<(SharedChannel, SharedChannel), ChannelError> {
    let control = unsafe {
        SharedChannel::from_raw(
            NonNull::from(&global_view.control_channel_sync),
            control_region.base_ptr(),
            control_region.size() as u32,
        )?
    };
    let feedback = unsafe {
        SharedChannel::from_raw(
            NonNull::from(&global_view.feedback_channel_sync),
            feedback_region.base_ptr(),
            feedback_region.size() as u32,
        )?
    };
    Ok((control, feedback))
}

fn region_table_entry(
    region: &MappedRegion,
    region_type: RegionType,
    name: &str,
) -> anyhow::Result<RegionTableEntry> {
    Ok(RegionTableEntry::new(
        region_type,
        0,
        region.size() as u64,
        name,
    )?)
}

fn create_named_region(name: &str, size: usize) -> anyhow::Result<MappedRegion> {
    let mut handle = NamedShmHandle::create_or_open(object_path(name)?, size)
        .with_context(|| format!("creating shared memory region {name}"))?;
    // Unlink on failure paths until the context is fully constructed.
    handle.set_cleanup_on_close(true);
    Ok(MappedRegion::Named(handle.map().with_context(|| {
        format!("mapping shared memory region {name}")
    })?))
}

fn open_named_region(name: &str) -> anyhow::Result<MappedRegion> {
    let handle = NamedShmHandle::open_existing(&object_path(name)?)
        .with_context(|| format!("opening shared memory region {name}"))?;
    Ok(MappedRegion::Named(handle.map().with_context(|| {
        format!("mapping shared memory region {name}")
    })?))
}

fn open_table_region(
    global_view: &GlobalMemoryRegion,
    region_type: RegionType,
) -> anyhow::Result<MappedRegion> {
    let entry = global_view.find_region(region_type, 0).ok_or_else(|| {
        anyhow::anyhow!("bootstrap table has no entry for region {region_type:?}")
    })?;
    open_named_region(entry.name())
}

#[cfg(unix)]
fn create_anonymous_region(size: usize) -> anyhow::Result<MappedRegion> {
    Ok(MappedRegion::Anonymous(
        ShmHandle::new(size)
            .context("creating anonymous region")?
            .map()
            .context("mapping anonymous region")?,
    ))
}

impl Drop for Context {
    fn drop(&mut self) {
        let control_stats = self.control.stats();
        let feedback_stats = self.feedback.stats();
        debug!(
            role = ?self.role,
            control_written = control_stats.frames_written.load(Ordering::Relaxed),
            control_read = control_stats.frames_read.load(Ordering::Relaxed),
            control_links = control_stats.link_frames_written.load(Ordering::Relaxed),
            feedback_written = feedback_stats.frames_written.load(Ordering::Relaxed),
            feedback_read = feedback_stats.frames_read.load(Ordering::Relaxed),
            "detaching context"
        );

        let remaining = self
            .global()
            .header
            .attached_processes_count
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        if remaining == 0 {
            debug!(role = ?self.role, "last detacher, scheduling OS cleanup");
            self.global_region.set_cleanup_on_close(true);
            self.control_region.set_cleanup_on_close(true);
            self.feedback_region.set_cleanup_on_close(true);
            self.config_region.set_cleanup_on_close(true);
            self.control_event.set_cleanup_on_close(true);
            self.feedback_event.set_cleanup_on_close(true);
            if let Some(event) = &mut self.target_ready_event {
                event.set_cleanup_on_close(true);
            }
        }

        #[cfg(unix)]
        if let TransportState::AnonymousAgent { server, acceptor } = &mut self.state {
            server.shutdown();
            if let Some(handle) = acceptor.take() {
                _ = handle.join();
            }
        }
    }
}
