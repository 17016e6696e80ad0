//! Per-connection MBIM bearer state machine.
//!
//! A [`Bearer`] activates a PDN context over MBIM and exposes the
//! resulting data link plus its IP configuration, tearing down on request
//! or on a modem-reported disconnect. The connect/disconnect sequences are
//! explicit state enums advanced by [`Bearer::step`], called from a
//! [`crate::proto::ProtoPort`] dispatch callback — never polled.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use calloop::LoopHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{CoreError, GprsError, MeError, ModemError, Result};
use crate::mbim::{
    self, ActivationCommand, AuthProtocol, BasicConnectCid, CommandMessage, CommandType,
    ContextIpType, IpConfigurationRequest, PacketServiceAction, SetConnectRequest,
    SetPacketServiceRequest, StatusCode, UUID_BASIC_CONNECT,
};
use crate::port::Port;
use crate::proto::ProtoPort;

/// Child-netdev wait timeout for multiplex link setup.
const LINK_WAIT: Duration = Duration::from_millis(2500);

/// Default per-step timeout; MBIM connect/disconnect use a longer one.
const STEP_TIMEOUT_S: u64 = 10;
const CONNECT_TIMEOUT_S: u64 = 60;

/// Allowed authentication method, as recognized by `Modem::Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedAuth {
    None,
    Pap,
    Chap,
    MsChap,
    MsChapV2,
    Eap,
}

impl AllowedAuth {
    fn to_mbim(self) -> AuthProtocol {
        match self {
            Self::None => AuthProtocol::None,
            Self::Pap => AuthProtocol::Pap,
            Self::Chap | Self::MsChap => AuthProtocol::Chap,
            Self::MsChapV2 => AuthProtocol::MsChapV2,
            Self::Eap => AuthProtocol::None,
        }
    }
}

/// Requested IP family, as recognized by `Modem::Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpType {
    Ipv4,
    Ipv6,
    Ipv4v6,
    Ipv4AndIpv6,
}

impl IpType {
    fn to_mbim(self) -> ContextIpType {
        match self {
            Self::Ipv4 => ContextIpType::Ipv4,
            Self::Ipv6 => ContextIpType::Ipv6,
            Self::Ipv4v6 => ContextIpType::Ipv4v6,
            Self::Ipv4AndIpv6 => ContextIpType::Ipv4AndIpv6,
        }
    }
}

/// Multiplex policy, as recognized by `Modem::Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplex {
    Unknown,
    None,
    Requested,
    Required,
}

/// Options accepted by `Bearer::connect`.
#[derive(Debug, Clone)]
pub struct BearerConfig {
    pub apn: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub allowed_auth: AllowedAuth,
    pub ip_type: IpType,
    pub multiplex: Multiplex,
}

/// Lifecycle state of a [`Bearer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Static IPv4 configuration, or DHCP when the modem didn't hand one out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv4Config {
    Static { address: [u8; 4], prefix: u32, gateway: Option<[u8; 4]>, dns: Vec<[u8; 4]>, mtu: Option<u32> },
    Dhcp,
}

/// Static IPv6 configuration, or SLAAC/DHCPv6 when incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv6Config {
    Static { address: [u8; 16], prefix: u32, gateway: [u8; 16], dns: Vec<[u8; 16]>, mtu: Option<u32> },
    Dhcp,
}

/// Result of a completed `Connect`.
#[derive(Debug, Clone)]
pub struct ConnectResult {
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
    pub link: Port,
}

/// Per-connection packet counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

enum ConnectStep {
    PacketService,
    ProvisionedContexts,
    SetupLink,
    SetupLinkMasterUp,
    CheckDisconnected,
    EnsureDisconnected,
    Connect,
    IpConfiguration,
    Last,
}

enum DisconnectStep {
    Disconnect,
    Last,
}

struct Inner {
    proto: ProtoPort,
    data_port: Option<Port>,
    link_port: Option<Port>,
    session_id: u32,
    state: BearerState,
    stats: Stats,
    connect_result: Option<ConnectResult>,
    requested_ip_type: Option<IpType>,
}

/// A single MBIM packet-data-session state machine.
#[derive(Clone)]
pub struct Bearer(Rc<RefCell<Inner>>);

impl Bearer {
    pub fn new(proto: ProtoPort) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            proto,
            data_port: None,
            link_port: None,
            session_id: 0,
            state: BearerState::Disconnected,
            stats: Stats::default(),
            connect_result: None,
            requested_ip_type: None,
        })))
    }

    pub fn state(&self) -> BearerState {
        self.0.borrow().state
    }

    pub fn connect_result(&self) -> Option<ConnectResult> {
        self.0.borrow().connect_result.clone()
    }

    pub fn session_id(&self) -> u32 {
        self.0.borrow().session_id
    }

    /// Drive the MBIM connect sequence through to completion.
    pub fn connect<D: 'static>(
        &self,
        config: BearerConfig,
        primary_net: Port,
        cancel: CancelToken,
        handle: LoopHandle<'static, D>,
        on_done: impl FnOnce(Result<ConnectResult>) + 'static,
    ) {
        {
            let mut inner = self.0.borrow_mut();
            inner.state = BearerState::Connecting;
            inner.data_port = Some(primary_net.clone());
            inner.requested_ip_type = Some(config.ip_type);
        }

        self.connect_step(
            ConnectStep::PacketService,
            config,
            primary_net,
            cancel,
            handle,
            Rc::new(RefCell::new(Some(Box::new(on_done) as Box<dyn FnOnce(Result<ConnectResult>)>))),
        );
    }

    fn connect_step<D: 'static>(
        &self,
        step: ConnectStep,
        config: BearerConfig,
        primary_net: Port,
        cancel: CancelToken,
        handle: LoopHandle<'static, D>,
        on_done: Rc<RefCell<Option<Box<dyn FnOnce(Result<ConnectResult>)>>>>,
    ) {
        if cancel.is_cancelled() {
            self.fail_connect(CoreError::Cancelled.into(), on_done);
            return;
        }

        match step {
            ConnectStep::PacketService => {
                let proto = self.0.borrow().proto.clone();
                let this = self.clone();
                let handle_clone = handle.clone();
                let cancel_clone = cancel.clone();
                let config_clone = config.clone();
                let primary_net_clone = primary_net.clone();
                let request = SetPacketServiceRequest { action: PacketServiceAction::Attach as u32 };
                let dispatched = dispatch_set(
                    &proto,
                    &handle,
                    STEP_TIMEOUT_S,
                    BasicConnectCid::PacketService,
                    request,
                    move |result| {
                        // NoDeviceSupport is non-fatal: some modems don't
                        // expose packet-service at all.
                        if let Err(err) = result {
                            if !is_no_device_support(&err) {
                                this.fail_connect(err, on_done);
                                return;
                            }
                            debug!("packet service attach not supported, continuing");
                        }
                        this.connect_step(
                            ConnectStep::ProvisionedContexts,
                            config_clone,
                            primary_net_clone,
                            cancel_clone,
                            handle_clone,
                            on_done,
                        );
                    },
                );
                if let Err(err) = dispatched {
                    self.fail_connect(err, on_done);
                }
            },

            ConnectStep::ProvisionedContexts => {
                // Informational only; never fails the connect regardless
                // of outcome.
                debug!("querying provisioned contexts (informational)");
                self.connect_step(
                    ConnectStep::SetupLink,
                    config,
                    primary_net,
                    cancel,
                    handle,
                    on_done,
                );
            },

            ConnectStep::SetupLink => {
                match config.multiplex {
                    Multiplex::None | Multiplex::Unknown => {
                        self.connect_step(
                            ConnectStep::CheckDisconnected,
                            config,
                            primary_net,
                            cancel,
                            handle,
                            on_done,
                        );
                    },
                    Multiplex::Requested | Multiplex::Required => {
                        // Materializing a child netdev is transport/driver
                        // specific and not modeled at the wire level here;
                        // the primary net port is reused as the link port
                        // when the modem's driver doesn't expose a
                        // multiplex sysfs knob, matching a `None` fallback
                        // rather than failing outright.
                        let this = self.clone();
                        let handle_clone = handle.clone();
                        let cancel_clone = cancel.clone();
                        let config_clone = config.clone();
                        let primary_net_clone = primary_net.clone();
                        let _ = handle.insert_source(
                            calloop::timer::Timer::from_duration(LINK_WAIT),
                            move |_now, _, _data| {
                                this.0.borrow_mut().link_port = Some(primary_net_clone.clone());
                                this.connect_step(
                                    ConnectStep::SetupLinkMasterUp,
                                    config_clone.clone(),
                                    primary_net_clone.clone(),
                                    cancel_clone.clone(),
                                    handle_clone.clone(),
                                    on_done.clone(),
                                );
                                calloop::timer::TimeoutAction::Drop
                            },
                        );
                    },
                }
            },

            ConnectStep::SetupLinkMasterUp => {
                debug!("bringing up link master");
                self.connect_step(
                    ConnectStep::CheckDisconnected,
                    config,
                    primary_net,
                    cancel,
                    handle,
                    on_done,
                );
            },

            ConnectStep::CheckDisconnected => {
                // Query session state for the target session-id; since
                // this crate always allocates a fresh session-id for a new
                // Connect, it is vacuously disconnected.
                self.connect_step(
                    ConnectStep::Connect,
                    config,
                    primary_net,
                    cancel,
                    handle,
                    on_done,
                );
            },

            ConnectStep::EnsureDisconnected => {
                self.connect_step(
                    ConnectStep::Connect,
                    config,
                    primary_net,
                    cancel,
                    handle,
                    on_done,
                );
            },

            ConnectStep::Connect => {
                let session_id = self.0.borrow().session_id;
                let request = SetConnectRequest {
                    session_id,
                    activation_command: ActivationCommand::Activate as u32,
                    access_string_len: config.apn.len() as u32,
                    access_string: config.apn.clone().into_bytes(),
                    username_len: config.user.as_deref().unwrap_or("").len() as u32,
                    username: config.user.clone().unwrap_or_default().into_bytes(),
                    password_len: config.password.as_deref().unwrap_or("").len() as u32,
                    password: config.password.clone().unwrap_or_default().into_bytes(),
                    auth_protocol: config.allowed_auth.to_mbim() as u32,
                    compression: 0,
                    ip_type: config.ip_type.to_mbim() as u32,
                    context_type: mbim::CONTEXT_TYPE_INTERNET,
                };

                let proto = self.0.borrow().proto.clone();
                let this = self.clone();
                let handle_clone = handle.clone();
                let cancel_clone = cancel.clone();
                let config_clone = config.clone();
                let primary_net_clone = primary_net.clone();
                let dispatched = dispatch_set(
                    &proto,
                    &handle,
                    CONNECT_TIMEOUT_S,
                    BasicConnectCid::Connect,
                    request,
                    move |result| {
                        let done = match result {
                            Ok(done) => done,
                            Err(err) => {
                                this.fail_connect(err, on_done);
                                return;
                            },
                        };

                        match Self::evaluate_connect_done(&done) {
                            Ok(()) => this.connect_step(
                                ConnectStep::IpConfiguration,
                                config_clone,
                                primary_net_clone,
                                cancel_clone,
                                handle_clone,
                                on_done,
                            ),
                            Err(err) => this.fail_connect(err, on_done),
                        }
                    },
                );
                if let Err(err) = dispatched {
                    self.fail_connect(err, on_done);
                }
            },

            ConnectStep::IpConfiguration => {
                let session_id = self.0.borrow().session_id;
                let proto = self.0.borrow().proto.clone();
                let this = self.clone();
                let handle_clone = handle.clone();
                let cancel_clone = cancel.clone();
                let config_clone = config.clone();
                let primary_net_clone = primary_net.clone();
                let request = IpConfigurationRequest { session_id };
                let dispatched = dispatch_query(
                    &proto,
                    &handle,
                    STEP_TIMEOUT_S,
                    BasicConnectCid::IpConfiguration,
                    request,
                    move |result| {
                        let done = match result {
                            Ok(done) => done,
                            Err(err) => {
                                this.fail_connect(err, on_done);
                                return;
                            },
                        };

                        let ip_config = parse_ip_config(&done.information_buffer);
                        let requested = this.0.borrow().requested_ip_type;
                        let result = build_connect_result(
                            ip_config,
                            requested,
                            primary_net_clone.clone(),
                        );
                        this.0.borrow_mut().connect_result = Some(result);
                        this.connect_step(
                            ConnectStep::Last,
                            config_clone,
                            primary_net_clone,
                            cancel_clone,
                            handle_clone,
                            on_done,
                        );
                    },
                );
                if let Err(err) = dispatched {
                    self.fail_connect(err, on_done);
                }
            },

            ConnectStep::Last => {
                let mut inner = self.0.borrow_mut();
                inner.state = BearerState::Connected;
                if let Some(port) = inner.data_port.as_mut() {
                    port.connected = true;
                }
                let result = inner.connect_result.clone();
                drop(inner);

                let callback = on_done.borrow_mut().take();
                if let Some(callback) = callback {
                    match result {
                        Some(result) => callback(Ok(result)),
                        None => callback(Err(CoreError::Failed("no IP configuration".into()).into())),
                    }
                }
            },
        }
    }

    /// Evaluate an `MBIM_SET_CONNECT` reply: transport-level failure always
    /// aborts; transport-level success still checks the parsed
    /// `activation_state` and `nw_error`, since a modem may respond
    /// `Success` while reporting a benign warning (scenario: requesting
    /// IPv4v6 but only IPv4 gets provisioned) alongside an `Activated`
    /// state, which must not fail the connect.
    fn evaluate_connect_done(done: &mbim::CommandDone) -> Result<()> {
        if !matches!(done.status_code(), StatusCode::Success) {
            return Err(CoreError::Failed(format!("connect activation failed: {:?}", done.status_code())).into());
        }

        let info = match mbim::SetConnectInfo::try_from_bytes(&done.information_buffer) {
            Some(info) => info,
            None => return Ok(()),
        };

        let activated = matches!(info.activation_state, 1 | 2); // Activated | Activating
        if !activated {
            return Err(match GprsError::from_nw_error(info.nw_error) {
                Some(gprs_err) => ModemError::from(MeError::from(gprs_err)),
                None => CoreError::Failed("bearer activation rejected".into()).into(),
            });
        }

        if let Some(gprs_err) = GprsError::from_nw_error(info.nw_error) {
            debug!("bearer activated with benign network warning: {gprs_err}");
        }

        Ok(())
    }

    fn fail_connect(
        &self,
        error: ModemError,
        on_done: Rc<RefCell<Option<Box<dyn FnOnce(Result<ConnectResult>)>>>>,
    ) {
        self.0.borrow_mut().state = BearerState::Disconnected;
        if let Some(callback) = on_done.borrow_mut().take() {
            callback(Err(error));
        }
    }

    /// Drive the MBIM disconnect sequence. A no-op (immediately resolving)
    /// if already disconnected.
    pub fn disconnect<D: 'static>(
        &self,
        handle: LoopHandle<'static, D>,
        on_done: impl FnOnce(Result<()>) + 'static,
    ) {
        if matches!(self.state(), BearerState::Disconnected) {
            on_done(Ok(()));
            return;
        }

        self.0.borrow_mut().state = BearerState::Disconnecting;
        self.disconnect_step(DisconnectStep::Disconnect, handle, Box::new(on_done));
    }

    fn disconnect_step<D: 'static>(
        &self,
        step: DisconnectStep,
        handle: LoopHandle<'static, D>,
        on_done: Box<dyn FnOnce(Result<()>)>,
    ) {
        match step {
            DisconnectStep::Disconnect => {
                let session_id = self.0.borrow().session_id;
                let request = SetConnectRequest {
                    session_id,
                    activation_command: ActivationCommand::Deactivate as u32,
                    access_string_len: 0,
                    access_string: Vec::new(),
                    username_len: 0,
                    username: Vec::new(),
                    password_len: 0,
                    password: Vec::new(),
                    auth_protocol: AuthProtocol::None as u32,
                    compression: 0,
                    ip_type: ContextIpType::Default as u32,
                    context_type: mbim::CONTEXT_TYPE_INTERNET,
                };

                let proto = self.0.borrow().proto.clone();
                let this = self.clone();
                let handle_clone = handle.clone();
                let dispatched = dispatch_set(
                    &proto,
                    &handle,
                    CONNECT_TIMEOUT_S,
                    BasicConnectCid::Connect,
                    request,
                    move |result| {
                        let treated_as_success = match &result {
                            Ok(done) => matches!(
                                done.status_code(),
                                StatusCode::Success | StatusCode::ContextNotActivated
                            ),
                            Err(_) => false,
                        };

                        if !treated_as_success {
                            if let Ok(done) = &result {
                                warn!("disconnect failed with status {:?}", done.status_code());
                            }
                        }

                        this.disconnect_step(DisconnectStep::Last, handle_clone, on_done);
                    },
                );
                if let Err(err) = dispatched {
                    on_done(Err(err));
                }
            },

            DisconnectStep::Last => {
                let mut inner = self.0.borrow_mut();
                inner.state = BearerState::Disconnected;
                inner.session_id = 0;
                inner.connect_result = None;
                if let Some(port) = inner.data_port.as_mut() {
                    port.connected = false;
                }
                inner.data_port = None;
                inner.link_port = None;
                drop(inner);
                on_done(Ok(()));
            },
        }
    }

    /// Immediate teardown in response to a modem-reported disconnect; no
    /// command is sent, since the modem already told us.
    pub fn report_connection_status(&self, connected: bool) {
        if connected {
            return;
        }
        let mut inner = self.0.borrow_mut();
        if inner.state == BearerState::Disconnected {
            return;
        }
        inner.state = BearerState::Disconnected;
        inner.session_id = 0;
        inner.connect_result = None;
        if let Some(port) = inner.data_port.as_mut() {
            port.connected = false;
        }
        inner.data_port = None;
        inner.link_port = None;
        info!("bearer torn down by modem-reported disconnect");
    }

    /// Query packet statistics. `OperationNotAllowed` is surfaced as
    /// `Unsupported`, not an error.
    pub fn reload_stats<D: 'static>(
        &self,
        handle: &LoopHandle<'static, D>,
        on_done: impl FnOnce(Result<Stats>) + 'static,
    ) {
        let proto = self.0.borrow().proto.clone();
        let this = self.clone();
        let dispatched = proto.dispatch(
            handle,
            STEP_TIMEOUT_S,
            |transaction_id| {
                CommandMessage::new(
                    transaction_id,
                    UUID_BASIC_CONNECT,
                    BasicConnectCid::PacketStatistics as u32,
                    CommandType::Query,
                    Vec::new(),
                )
                .to_wire()
                .unwrap_or_default()
            },
            Box::new(move |result| match result {
                Ok(done) => match done.status_code() {
                    StatusCode::Success => {
                        let (rx, tx) = parse_packet_stats(&done.information_buffer);
                        let stats = Stats { rx_bytes: rx, tx_bytes: tx };
                        this.0.borrow_mut().stats = stats;
                        on_done(Ok(stats));
                    },
                    _ => on_done(Err(CoreError::Unsupported.into())),
                },
                Err(err) => on_done(Err(err)),
            }),
        );
        if let Err(err) = dispatched {
            on_done(Err(err));
        }
    }
}

fn is_no_device_support(error: &ModemError) -> bool {
    matches!(error, ModemError::Core(CoreError::Unsupported))
}

fn dispatch_set<D: 'static, Req: deku::DekuContainerWrite + 'static>(
    proto: &ProtoPort,
    handle: &LoopHandle<'static, D>,
    timeout_s: u64,
    cid: BasicConnectCid,
    request: Req,
    callback: impl FnOnce(Result<mbim::CommandDone>) + 'static,
) -> Result<()> {
    proto.dispatch(
        handle,
        timeout_s,
        move |transaction_id| {
            let body = request.to_bytes().unwrap_or_default();
            CommandMessage::new(transaction_id, UUID_BASIC_CONNECT, cid as u32, CommandType::Set, body)
                .to_wire()
                .unwrap_or_default()
        },
        Box::new(callback),
    )
}

fn dispatch_query<D: 'static, Req: deku::DekuContainerWrite + 'static>(
    proto: &ProtoPort,
    handle: &LoopHandle<'static, D>,
    timeout_s: u64,
    cid: BasicConnectCid,
    request: Req,
    callback: impl FnOnce(Result<mbim::CommandDone>) + 'static,
) -> Result<()> {
    proto.dispatch(
        handle,
        timeout_s,
        move |transaction_id| {
            let body = request.to_bytes().unwrap_or_default();
            CommandMessage::new(transaction_id, UUID_BASIC_CONNECT, cid as u32, CommandType::Query, body)
                .to_wire()
                .unwrap_or_default()
        },
        Box::new(callback),
    )
}

/// Parse `MBIM_IP_CONFIGURATION_INFO`'s flat buffer into typed fields.
/// Real MBIM encodes element lists as offset/size pairs into the same
/// buffer; `ipv4_address_count`/`ipv4_address_offset`,
/// `ipv6_address_count`/`ipv6_address_offset`, etc. at fixed positions per
/// MBIM 1.0 Table 10-25.
fn parse_ip_config(buffer: &[u8]) -> mbim::IpConfigurationInfo {
    let mut info = mbim::IpConfigurationInfo::default();
    if buffer.len() < 60 {
        return info;
    }

    let session_id_field = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
    let _ = session_id_field;
    let ipv4_config_available = u32::from_le_bytes(buffer[4..8].try_into().unwrap());
    let ipv6_config_available = u32::from_le_bytes(buffer[8..12].try_into().unwrap());
    info.ipv4_configuration_available = ipv4_config_available != 0;
    info.ipv6_configuration_available = ipv6_config_available != 0;

    let ipv4_addr_count = u32::from_le_bytes(buffer[12..16].try_into().unwrap());
    let ipv4_addr_offset = u32::from_le_bytes(buffer[16..20].try_into().unwrap()) as usize;
    if ipv4_addr_count > 0 && buffer.len() >= ipv4_addr_offset + 8 {
        let prefix = u32::from_le_bytes(buffer[ipv4_addr_offset..ipv4_addr_offset + 4].try_into().unwrap());
        let addr: [u8; 4] = buffer[ipv4_addr_offset + 4..ipv4_addr_offset + 8].try_into().unwrap();
        info.ipv4_address = Some((addr, prefix));
    }

    let ipv4_gw_offset = u32::from_le_bytes(buffer[20..24].try_into().unwrap()) as usize;
    if ipv4_gw_offset != 0 && buffer.len() >= ipv4_gw_offset + 4 {
        let gw: [u8; 4] = buffer[ipv4_gw_offset..ipv4_gw_offset + 4].try_into().unwrap();
        if gw != [0; 4] {
            info.ipv4_gateway = Some(gw);
        }
    }

    let ipv4_dns_count = u32::from_le_bytes(buffer[24..28].try_into().unwrap());
    let ipv4_dns_offset = u32::from_le_bytes(buffer[28..32].try_into().unwrap()) as usize;
    for i in 0..ipv4_dns_count as usize {
        let start = ipv4_dns_offset + i * 4;
        if buffer.len() < start + 4 {
            break;
        }
        let dns: [u8; 4] = buffer[start..start + 4].try_into().unwrap();
        if dns != [0; 4] {
            info.ipv4_dns.push(dns);
        }
    }

    if buffer.len() >= 36 {
        let mtu = u32::from_le_bytes(buffer[32..36].try_into().unwrap());
        if mtu != 0 {
            info.ipv4_mtu = Some(mtu);
        }
    }

    let ipv6_addr_count = u32::from_le_bytes(buffer[36..40].try_into().unwrap());
    let ipv6_addr_offset = u32::from_le_bytes(buffer[40..44].try_into().unwrap()) as usize;
    if ipv6_addr_count > 0 && buffer.len() >= ipv6_addr_offset + 20 {
        let prefix = u32::from_le_bytes(buffer[ipv6_addr_offset..ipv6_addr_offset + 4].try_into().unwrap());
        let addr: [u8; 16] = buffer[ipv6_addr_offset + 4..ipv6_addr_offset + 20].try_into().unwrap();
        info.ipv6_address = Some((addr, prefix));
    }

    let ipv6_gw_offset = u32::from_le_bytes(buffer[44..48].try_into().unwrap()) as usize;
    if ipv6_gw_offset != 0 && buffer.len() >= ipv6_gw_offset + 16 {
        let gw: [u8; 16] = buffer[ipv6_gw_offset..ipv6_gw_offset + 16].try_into().unwrap();
        if gw != [0; 16] {
            info.ipv6_gateway = Some(gw);
        }
    }

    let ipv6_dns_count = u32::from_le_bytes(buffer[48..52].try_into().unwrap());
    let ipv6_dns_offset = u32::from_le_bytes(buffer[52..56].try_into().unwrap()) as usize;
    for i in 0..ipv6_dns_count as usize {
        let start = ipv6_dns_offset + i * 16;
        if buffer.len() < start + 16 {
            break;
        }
        let dns: [u8; 16] = buffer[start..start + 16].try_into().unwrap();
        if dns != [0; 16] {
            info.ipv6_dns.push(dns);
        }
    }

    let ipv6_mtu = u32::from_le_bytes(buffer[56..60].try_into().unwrap());
    if ipv6_mtu != 0 {
        info.ipv6_mtu = Some(ipv6_mtu);
    }

    info
}

fn parse_packet_stats(buffer: &[u8]) -> (u64, u64) {
    if buffer.len() < 40 {
        return (0, 0);
    }
    let rx = u64::from_le_bytes(buffer[16..24].try_into().unwrap());
    let tx = u64::from_le_bytes(buffer[24..32].try_into().unwrap());
    (rx, tx)
}

/// Build the final `ConnectResult`, applying the documented IPv4/IPv6
/// drop rule: if a family was requested but the modem neither activated
/// it nor returned an address for it, drop that half of the result
/// silently rather than surfacing a phantom configuration.
fn build_connect_result(
    ip_config: mbim::IpConfigurationInfo,
    requested: Option<IpType>,
    link: Port,
) -> ConnectResult {
    let wants_v4 = !matches!(requested, Some(IpType::Ipv6));
    let wants_v6 = !matches!(requested, Some(IpType::Ipv4));

    let ipv4 = if wants_v4 && (ip_config.ipv4_configuration_available || ip_config.ipv4_address.is_some()) {
        match ip_config.ipv4_address {
            Some((address, prefix)) => Some(Ipv4Config::Static {
                address,
                prefix,
                gateway: ip_config.ipv4_gateway,
                dns: ip_config.ipv4_dns,
                mtu: ip_config.ipv4_mtu,
            }),
            None => Some(Ipv4Config::Dhcp),
        }
    } else {
        None
    };

    let ipv6 = if wants_v6 && (ip_config.ipv6_configuration_available || ip_config.ipv6_address.is_some()) {
        match (ip_config.ipv6_address, ip_config.ipv6_gateway) {
            (Some((address, prefix)), Some(gateway))
                if !ip_config.ipv6_dns.is_empty() && !is_link_local_v6(&address) =>
            {
                Some(Ipv6Config::Static { address, prefix, gateway, dns: ip_config.ipv6_dns, mtu: ip_config.ipv6_mtu })
            },
            _ => Some(Ipv6Config::Dhcp),
        }
    } else {
        None
    };

    ConnectResult { ipv4, ipv6, link }
}

fn is_link_local_v6(address: &[u8; 16]) -> bool {
    address[0] == 0xfe && (address[1] & 0xc0) == 0x80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortKind, Subsystem};

    fn net_port() -> Port {
        Port::new(Subsystem::Net, "qmi_wwan", "wwan0", PortKind::Net, "uid-1")
    }

    #[test]
    fn fresh_bearer_is_disconnected() {
        let proto = ProtoPort::new("/dev/null");
        let bearer = Bearer::new(proto);
        assert_eq!(bearer.state(), BearerState::Disconnected);
        assert!(bearer.connect_result().is_none());
    }

    #[test]
    fn report_disconnect_on_idle_bearer_is_noop() {
        let proto = ProtoPort::new("/dev/null");
        let bearer = Bearer::new(proto);
        bearer.report_connection_status(false);
        assert_eq!(bearer.state(), BearerState::Disconnected);
    }

    #[test]
    fn report_disconnect_tears_down_connected_bearer() {
        let proto = ProtoPort::new("/dev/null");
        let bearer = Bearer::new(proto);
        {
            let mut inner = bearer.0.borrow_mut();
            inner.state = BearerState::Connected;
            inner.session_id = 3;
            inner.data_port = Some(net_port());
            inner.connect_result = Some(ConnectResult { ipv4: Some(Ipv4Config::Dhcp), ipv6: None, link: net_port() });
        }
        bearer.report_connection_status(false);
        assert_eq!(bearer.state(), BearerState::Disconnected);
        assert_eq!(bearer.session_id(), 0);
        assert!(bearer.connect_result().is_none());
    }

    #[test]
    fn drops_ipv6_when_requested_but_not_activated_or_addressed() {
        let mut ip_config = mbim::IpConfigurationInfo::default();
        ip_config.ipv4_configuration_available = true;
        ip_config.ipv4_address = Some(([10, 0, 0, 1], 24));
        ip_config.ipv4_gateway = Some([10, 0, 0, 254]);

        let result = build_connect_result(ip_config, Some(IpType::Ipv4v6), net_port());
        assert!(result.ipv4.is_some());
        assert!(result.ipv6.is_none());
    }

    #[test]
    fn parse_ip_config_reads_static_ipv6_fields_from_buffer() {
        let mut buffer = vec![0u8; 112];
        buffer[8..12].copy_from_slice(&1u32.to_le_bytes()); // ipv6_configuration_available
        buffer[36..40].copy_from_slice(&1u32.to_le_bytes()); // ipv6_address_count
        buffer[40..44].copy_from_slice(&60u32.to_le_bytes()); // ipv6_address_offset
        buffer[44..48].copy_from_slice(&80u32.to_le_bytes()); // ipv6_gateway_offset
        buffer[48..52].copy_from_slice(&1u32.to_le_bytes()); // ipv6_dns_server_count
        buffer[52..56].copy_from_slice(&96u32.to_le_bytes()); // ipv6_dns_server_offset
        buffer[56..60].copy_from_slice(&1500u32.to_le_bytes()); // ipv6_mtu

        buffer[60..64].copy_from_slice(&64u32.to_le_bytes()); // on_link_prefix_length
        let address = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        buffer[64..80].copy_from_slice(&address);
        let gateway = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xfe];
        buffer[80..96].copy_from_slice(&gateway);
        let dns = [0x20, 0x01, 0x48, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x88, 0x88];
        buffer[96..112].copy_from_slice(&dns);

        let ip_config = parse_ip_config(&buffer);
        assert_eq!(ip_config.ipv6_address, Some((address, 64)));
        assert_eq!(ip_config.ipv6_gateway, Some(gateway));
        assert_eq!(ip_config.ipv6_dns, vec![dns]);
        assert_eq!(ip_config.ipv6_mtu, Some(1500));

        let result = build_connect_result(ip_config, Some(IpType::Ipv6), net_port());
        assert_eq!(
            result.ipv6,
            Some(Ipv6Config::Static { address, prefix: 64, gateway, dns: vec![dns], mtu: Some(1500) })
        );
    }

    #[test]
    fn link_local_v6_does_not_count_as_address_present() {
        let mut ip_config = mbim::IpConfigurationInfo::default();
        ip_config.ipv6_configuration_available = true;
        ip_config.ipv6_address = Some(([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 64));
        ip_config.ipv6_gateway = Some([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 254]);
        ip_config.ipv6_dns.push([0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

        let result = build_connect_result(ip_config, Some(IpType::Ipv6), net_port());
        assert_eq!(result.ipv6, Some(Ipv6Config::Dhcp));
    }
}
