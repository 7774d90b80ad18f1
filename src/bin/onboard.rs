//! Operator CLI for admitting organizations and peer nodes into a running
//! channel.
//!
//! Every command reads the operator configuration (`--config <file>`, then
//! `ONBOARD_*` overrides) and drives the coordinator over the CA and ordering
//! gateways it names. `simulate` runs the same pipeline against an in-process
//! network.

use consortium_onboard::channel::OrgPolicies;
use consortium_onboard::coordinator::{
    ChangeState, Collaborators, MembershipChangeRequest, MembershipCoordinator, OnboardingRequest,
};
use consortium_onboard::model::{Endpoint, Participant, RequestId};
use consortium_onboard::node::{DeploymentDescriptor, DockerRuntime, NodeSpec};
use consortium_onboard::provision::{CaDirectory, EnrollmentSpec};
use consortium_onboard::remote::{HttpCaClient, HttpOrdererClient};
use consortium_onboard::sim::{msp_for, SimNetwork};
use consortium_onboard::store::{FileRequestStore, MemoryRequestStore, RequestStore};
use consortium_onboard::trust::TrustMaterialBuilder;
use consortium_onboard::wallet::{FileWallet, MemoryWallet};
use consortium_onboard::OnboardConfig;
use std::{
    env, fs,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing_subscriber::EnvFilter;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: onboard [--config <file>] <command> ...");
    println!("  add-org --org <name> [--msp <id>] [--channel <name>] [--admin <id>]");
    println!("          [--admin-secret <secret>] [--user <id>] [--anchor <host:port>]...");
    println!("          [--peer <name> --port <n>] [--request-id <id>]");
    println!("  add-node --name <peer> --org <name> --port <n> [--msp <id>] [--channel <name>]");
    println!("           [--enrollment <id>] [--secret <secret>] [--bootstrap <host:port>]");
    println!("           [--operations-port <n>] [--image <ref>] [--anchor] [--request-id <id>]");
    println!("  retry <request-id>");
    println!("  status [<request-id>]");
    println!("  descriptor --name <peer> --org <name> --port <n> [--msp <id>]");
    println!("             [--bootstrap <host:port>] [--out <file>]");
    println!("  simulate [--org <name>] [--with-node] [--stall <signer-id>] [--heal]");
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let mut config_path: Option<PathBuf> = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            fatal("--config expects a value");
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }
    if args.is_empty() {
        print_help();
        std::process::exit(1);
    }
    let command = args.remove(0);
    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return;
    }
    let config = OnboardConfig::load(config_path.as_deref())
        .unwrap_or_else(|err| fatal(&format!("failed to load config: {err}")));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));

    let ok = match command.as_str() {
        "add-org" => runtime.block_on(cmd_add_org(&config, args)),
        "add-node" => runtime.block_on(cmd_add_node(&config, args)),
        "retry" => runtime.block_on(cmd_retry(&config, args)),
        "status" => cmd_status(&config, args),
        "descriptor" => cmd_descriptor(&config, args),
        "simulate" => runtime.block_on(cmd_simulate(&config, args)),
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            false
        }
    };
    if !ok {
        std::process::exit(1);
    }
}

fn value(iter: &mut impl Iterator<Item = String>, flag: &str) -> String {
    iter.next()
        .unwrap_or_else(|| fatal(&format!("{flag} expects a value")))
}

fn port(raw: &str, flag: &str) -> u16 {
    raw.parse()
        .unwrap_or_else(|_| fatal(&format!("{flag} expects a port number")))
}

fn endpoint(raw: &str) -> Endpoint {
    let (host, p) = raw
        .rsplit_once(':')
        .unwrap_or_else(|| fatal(&format!("endpoint must be host:port, got {raw}")));
    Endpoint::new(host, port(p, "endpoint"))
}

fn request_id(raw: &str) -> RequestId {
    RequestId::parse(raw).unwrap_or_else(|| fatal(&format!("invalid request id: {raw}")))
}

fn enrollment(id: String, secret: Option<String>) -> EnrollmentSpec {
    EnrollmentSpec {
        enrollment_id: id,
        secret,
    }
}

fn remote_collaborators(config: &OnboardConfig) -> Collaborators {
    let t = config.timeouts;
    let mut cas = CaDirectory::new();
    for (org, ep) in &config.certificate_authorities {
        let client = HttpCaClient::new(ep.clone(), t.ca())
            .unwrap_or_else(|err| fatal(&format!("ca client for {org}: {err}")));
        cas.insert(org.clone(), Arc::new(client));
    }
    let url = config
        .orderer_url
        .clone()
        .unwrap_or_else(|| fatal("orderer_url is not configured (set ONBOARD_ORDERER_URL)"));
    let orderer = HttpOrdererClient::new(url, t.orderer())
        .unwrap_or_else(|err| fatal(&format!("orderer client: {err}")));
    let signers = config
        .signer_directory()
        .unwrap_or_else(|err| fatal(&format!("failed to load signers: {err}")));
    Collaborators {
        cas,
        orderer: Arc::new(orderer),
        codec: config.codec(),
        runtime: Arc::new(DockerRuntime::new(&config.docker)),
        signers,
        wallet: Arc::new(FileWallet::new(&config.wallet_dir)),
        store: Arc::new(FileRequestStore::new(&config.request_dir)),
    }
}

fn print_record(record: &MembershipChangeRequest) {
    println!("request: {}", record.id);
    println!("participant: {}", record.participant);
    println!("channel: {}", record.request.channel());
    println!("attempt: {}", record.attempt);
    println!("state: {}", record.state.name());
    if let ChangeState::Failed {
        step,
        kind,
        detail,
        retriable,
    } = &record.state
    {
        println!("failed_step: {step}");
        println!("failure_kind: {kind:?}");
        println!("detail: {detail}");
        println!("retriable: {retriable}");
    }
    if let Some(commit) = &record.commit {
        println!("committed_version: {}", commit.version);
        println!("update_digest: {}", commit.update_digest);
    }
    if let Some(node) = &record.node {
        println!("node: {} ({})", node.id, node.endpoint);
    }
    for bundle in &record.bundles {
        println!("bundle: {}", bundle.display());
    }
    for t in &record.history {
        println!("  [{}] {} @ {}", t.attempt, t.state.name(), t.at_ms);
    }
}

async fn submit_and_run(
    coordinator: &MembershipCoordinator,
    id: Option<RequestId>,
    request: OnboardingRequest,
) -> bool {
    let submitted = match id {
        Some(id) => coordinator.submit_request_as(id, request).await,
        None => coordinator.submit_request(request).await,
    };
    let record = submitted.unwrap_or_else(|err| fatal(&format!("request refused: {err}")));
    let record = coordinator
        .run(&record.id)
        .await
        .unwrap_or_else(|err| fatal(&format!("run failed: {err}")));
    print_record(&record);
    !record.is_failed()
}

async fn cmd_add_org(config: &OnboardConfig, args: Vec<String>) -> bool {
    let mut org: Option<String> = None;
    let mut msp: Option<String> = None;
    let mut channel = config.channel.clone();
    let mut admin = "admin".to_string();
    let mut admin_secret: Option<String> = None;
    let mut user: Option<String> = None;
    let mut anchors = Vec::new();
    let mut peer: Option<String> = None;
    let mut peer_port: Option<u16> = None;
    let mut id: Option<RequestId> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--org" => org = Some(value(&mut iter, "--org")),
            "--msp" => msp = Some(value(&mut iter, "--msp")),
            "--channel" => channel = value(&mut iter, "--channel"),
            "--admin" => admin = value(&mut iter, "--admin"),
            "--admin-secret" => admin_secret = Some(value(&mut iter, "--admin-secret")),
            "--user" => user = Some(value(&mut iter, "--user")),
            "--anchor" => anchors.push(endpoint(&value(&mut iter, "--anchor"))),
            "--peer" => peer = Some(value(&mut iter, "--peer")),
            "--port" => peer_port = Some(port(&value(&mut iter, "--port"), "--port")),
            "--request-id" => id = Some(request_id(&value(&mut iter, "--request-id"))),
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let org = org.unwrap_or_else(|| fatal("--org is required"));
    let msp_id = msp.unwrap_or_else(|| msp_for(&org));
    let initial_node = match (peer, peer_port) {
        (Some(name), Some(p)) => Some(NodeSpec::new(name, &org, &msp_id, p)),
        (None, None) => None,
        _ => fatal("--peer and --port go together"),
    };
    let request = OnboardingRequest::AddOrganization {
        organization: org,
        policies: Some(OrgPolicies::standard(&msp_id)),
        msp_id,
        channel,
        admin: enrollment(admin, admin_secret),
        user: user.map(EnrollmentSpec::new),
        anchor_peers: anchors,
        initial_node,
    };
    let coordinator = MembershipCoordinator::new(config, remote_collaborators(config));
    submit_and_run(&coordinator, id, request).await
}

struct NodeArgs {
    spec: NodeSpec,
    rest: Vec<String>,
}

fn parse_node_args(args: Vec<String>) -> NodeArgs {
    let mut name: Option<String> = None;
    let mut org: Option<String> = None;
    let mut msp: Option<String> = None;
    let mut node_port: Option<u16> = None;
    let mut bootstrap: Option<Endpoint> = None;
    let mut operations: Option<u16> = None;
    let mut image: Option<String> = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => name = Some(value(&mut iter, "--name")),
            "--org" => org = Some(value(&mut iter, "--org")),
            "--msp" => msp = Some(value(&mut iter, "--msp")),
            "--port" => node_port = Some(port(&value(&mut iter, "--port"), "--port")),
            "--bootstrap" => bootstrap = Some(endpoint(&value(&mut iter, "--bootstrap"))),
            "--operations-port" => {
                operations = Some(port(
                    &value(&mut iter, "--operations-port"),
                    "--operations-port",
                ))
            }
            "--image" => image = Some(value(&mut iter, "--image")),
            _ => rest.push(arg),
        }
    }
    let name = name.unwrap_or_else(|| fatal("--name is required"));
    let org = org.unwrap_or_else(|| fatal("--org is required"));
    let node_port = node_port.unwrap_or_else(|| fatal("--port is required"));
    let msp_id = msp.unwrap_or_else(|| msp_for(&org));
    let mut spec = NodeSpec::new(name, org, msp_id, node_port);
    spec.bootstrap_peer = bootstrap;
    spec.operations_port = operations;
    spec.image = image;
    NodeArgs { spec, rest }
}

async fn cmd_add_node(config: &OnboardConfig, args: Vec<String>) -> bool {
    let NodeArgs { spec, rest } = parse_node_args(args);
    let mut channel = config.channel.clone();
    let mut enrollment_id = spec.name.clone();
    let mut secret: Option<String> = None;
    let mut announce_anchor = false;
    let mut id: Option<RequestId> = None;
    let mut iter = rest.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--channel" => channel = value(&mut iter, "--channel"),
            "--enrollment" => enrollment_id = value(&mut iter, "--enrollment"),
            "--secret" => secret = Some(value(&mut iter, "--secret")),
            "--anchor" => announce_anchor = true,
            "--request-id" => id = Some(request_id(&value(&mut iter, "--request-id"))),
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let request = OnboardingRequest::AddNode {
        node: spec,
        channel,
        enrollment: enrollment(enrollment_id, secret),
        announce_anchor,
    };
    let coordinator = MembershipCoordinator::new(config, remote_collaborators(config));
    submit_and_run(&coordinator, id, request).await
}

async fn cmd_retry(config: &OnboardConfig, args: Vec<String>) -> bool {
    let [raw] = args.as_slice() else {
        fatal("Usage: onboard retry <request-id>");
    };
    let coordinator = MembershipCoordinator::new(config, remote_collaborators(config));
    let record = coordinator
        .retry(&request_id(raw))
        .await
        .unwrap_or_else(|err| fatal(&format!("retry refused: {err}")));
    print_record(&record);
    !record.is_failed()
}

fn cmd_status(config: &OnboardConfig, args: Vec<String>) -> bool {
    let store = FileRequestStore::new(&config.request_dir);
    let load = |id: &RequestId| -> MembershipChangeRequest {
        store
            .load(id)
            .unwrap_or_else(|err| fatal(&format!("failed to read request {id}: {err}")))
            .unwrap_or_else(|| fatal(&format!("unknown request: {id}")))
    };
    match args.as_slice() {
        [] => {
            let ids = store
                .ids()
                .unwrap_or_else(|err| fatal(&format!("failed to list requests: {err}")));
            for id in &ids {
                let record = load(id);
                println!(
                    "{}\t{}\t{}\tattempt {}",
                    record.id,
                    record.participant,
                    record.state.name(),
                    record.attempt
                );
            }
            true
        }
        [raw] => {
            print_record(&load(&request_id(raw)));
            true
        }
        _ => fatal("Usage: onboard status [<request-id>]"),
    }
}

fn cmd_descriptor(config: &OnboardConfig, args: Vec<String>) -> bool {
    let NodeArgs { spec, rest } = parse_node_args(args);
    let mut out: Option<PathBuf> = None;
    let mut iter = rest.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => out = Some(PathBuf::from(value(&mut iter, "--out"))),
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let participant: Participant = spec.participant();
    let trust = TrustMaterialBuilder::new(&config.trust_root, &config.domain);
    let bundle = trust
        .existing(&participant)
        .unwrap_or_else(|err| fatal(&format!("failed to read trust bundle: {err}")))
        .unwrap_or_else(|| {
            fatal(&format!(
                "no trust bundle for {participant} under {}; provision the node first",
                config.trust_root.display()
            ))
        });
    let descriptor = DeploymentDescriptor::for_node(&spec, &bundle, &config.deployment());
    let yaml = descriptor
        .to_compose_yaml()
        .unwrap_or_else(|err| fatal(&format!("failed to render descriptor: {err}")));
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(&path, &yaml)
                .unwrap_or_else(|err| fatal(&format!("failed to write descriptor: {err}")));
            println!("descriptor_path: {}", path.display());
        }
        None => print!("{yaml}"),
    }
    true
}

async fn cmd_simulate(config: &OnboardConfig, args: Vec<String>) -> bool {
    let mut org = "org3".to_string();
    let mut with_node = false;
    let mut stall: Option<String> = None;
    let mut heal = false;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--org" => org = value(&mut iter, "--org"),
            "--with-node" => with_node = true,
            "--stall" => stall = Some(value(&mut iter, "--stall")),
            "--heal" => heal = true,
            other => fatal(&format!("unknown argument: {other}")),
        }
    }

    let mut net = SimNetwork::bootstrap(&config.domain, &config.channel, &["org1", "org2"]);
    net.add_ca(&org);
    if let Some(signer) = &stall {
        net.stall_signer(signer);
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut sim_config = config.clone();
    sim_config.trust_root = env::temp_dir().join(format!("onboard_sim_{nanos}"));
    sim_config.timeouts.signer_ms = sim_config.timeouts.signer_ms.min(2_000);
    sim_config.timeouts.poll_interval_ms = sim_config.timeouts.poll_interval_ms.min(50);
    let wallet = Arc::new(MemoryWallet::new());
    let store = Arc::new(MemoryRequestStore::new());

    let msp_id = msp_for(&org);
    let initial_node = with_node.then(|| NodeSpec::new("peer0", &org, &msp_id, 11051));
    let request = OnboardingRequest::AddOrganization {
        organization: org.clone(),
        policies: None,
        msp_id,
        channel: sim_config.channel.clone(),
        admin: EnrollmentSpec::new("admin"),
        user: Some(EnrollmentSpec::new("user1")),
        anchor_peers: Vec::new(),
        initial_node,
    };
    let coordinator = MembershipCoordinator::new(
        &sim_config,
        net.collaborators(wallet.clone(), store.clone()),
    );
    let record = coordinator
        .onboard(request)
        .await
        .unwrap_or_else(|err| fatal(&format!("simulation refused: {err}")));
    print_record(&record);

    let mut ok = !record.is_failed();
    if !ok && heal {
        if let Some(owner) = stall.as_deref().and_then(|s| s.strip_suffix("-admin")) {
            net.restore_signer(owner);
        }
        let coordinator =
            MembershipCoordinator::new(&sim_config, net.collaborators(wallet, store));
        let retried = coordinator
            .retry(&record.id)
            .await
            .unwrap_or_else(|err| fatal(&format!("retry refused: {err}")));
        println!("--- retry");
        print_record(&retried);
        ok = !retried.is_failed();
    }
    println!(
        "channel {} now has {} organizations at version {}",
        sim_config.channel,
        net.orderer.config().organizations.len(),
        net.orderer.config().sequence
    );
    let _ = fs::remove_dir_all(&sim_config.trust_root);
    ok
}
