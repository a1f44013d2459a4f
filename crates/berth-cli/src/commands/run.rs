use super::{container_exit_code, EXIT_SUCCESS};
use berth_core::{Engine, RunOutcome};
use berth_schema::RunOptions;
use clap::Args;
use std::path::PathBuf;

/// Flags of `berth run`, one field per option.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Run in the background and print the container id.
    #[arg(short, long)]
    pub detach: bool,
    /// Allocate a pseudo-TTY.
    #[arg(short, long)]
    pub tty: bool,
    /// Keep STDIN open.
    #[arg(short, long)]
    pub interactive: bool,
    /// Remove the container when it exits.
    #[arg(long)]
    pub rm: bool,
    /// Container name.
    #[arg(long)]
    pub name: Option<String>,

    #[arg(short, long)]
    pub user: Option<String>,
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// Overwrite the image entrypoint; an empty string clears it.
    #[arg(long, allow_hyphen_values = true)]
    pub entrypoint: Option<String>,
    /// Set an environment variable (KEY=VALUE, or KEY to inherit).
    #[arg(short, long = "env", value_name = "ENV")]
    pub env: Vec<String>,
    #[arg(long = "env-file", value_name = "FILE")]
    pub env_file: Vec<PathBuf>,
    #[arg(long)]
    pub umask: Option<String>,
    #[arg(long = "group-add", value_name = "GROUP")]
    pub group_add: Vec<String>,
    /// Run an init process inside the container.
    #[arg(long)]
    pub init: bool,

    /// Restart policy: no, always, on-failure[:N], unless-stopped.
    #[arg(long)]
    pub restart: Option<String>,
    #[arg(long)]
    pub stop_signal: Option<String>,
    /// Seconds to wait for the stop signal before SIGKILL; negative waits forever.
    #[arg(long, allow_negative_numbers = true)]
    pub stop_timeout: Option<i64>,

    /// Pull policy: always, missing, never.
    #[arg(long)]
    pub pull: Option<String>,
    #[arg(long)]
    pub platform: Option<String>,
    /// Treat IMAGE as the path of an unpacked root filesystem.
    #[arg(long)]
    pub rootfs: bool,

    /// Attach to a network (bridge, host, none, container:<name>, or a user network).
    #[arg(long = "network", visible_alias = "net", value_name = "NETWORK")]
    pub network: Vec<String>,
    #[arg(long)]
    pub ip: Option<String>,
    #[arg(long)]
    pub ip6: Option<String>,
    #[arg(long)]
    pub mac_address: Option<String>,
    #[arg(long)]
    pub hostname: Option<String>,
    #[arg(long)]
    pub domainname: Option<String>,
    #[arg(long)]
    pub dns: Vec<String>,
    #[arg(long)]
    pub dns_search: Vec<String>,
    #[arg(long, visible_alias = "dns-option")]
    pub dns_opt: Vec<String>,
    /// Publish a container port: [ip:][hostPort:]containerPort[/proto].
    #[arg(short, long)]
    pub publish: Vec<String>,
    /// Add a custom host-to-IP mapping (host:ip).
    #[arg(long)]
    pub add_host: Vec<String>,

    #[arg(long)]
    pub ipc: Option<String>,
    #[arg(long)]
    pub pid: Option<String>,
    #[arg(long)]
    pub uts: Option<String>,
    #[arg(long)]
    pub cgroupns: Option<String>,
    #[arg(long)]
    pub userns: Option<String>,

    #[arg(long)]
    pub cpus: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    pub cpu_quota: Option<i64>,
    #[arg(long)]
    pub cpu_period: Option<u64>,
    #[arg(long)]
    pub cpu_shares: Option<u64>,
    #[arg(long)]
    pub cpuset_cpus: Option<String>,
    #[arg(long)]
    pub cpuset_mems: Option<String>,
    /// Memory limit, e.g. 512m.
    #[arg(short, long)]
    pub memory: Option<String>,
    /// Memory plus swap; -1 for unlimited.
    #[arg(long, allow_hyphen_values = true)]
    pub memory_swap: Option<String>,
    #[arg(long)]
    pub memory_reservation: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    pub memory_swappiness: Option<i64>,
    #[arg(long)]
    pub kernel_memory: Option<String>,
    #[arg(long)]
    pub oom_kill_disable: bool,
    #[arg(long, allow_negative_numbers = true)]
    pub oom_score_adj: Option<i32>,
    #[arg(long, allow_negative_numbers = true)]
    pub pids_limit: Option<i64>,
    /// Set a cgroup v2 file (KEY=VALUE).
    #[arg(long)]
    pub cgroup_conf: Vec<String>,
    #[arg(long)]
    pub cgroup_parent: Option<String>,
    #[arg(long)]
    pub blkio_weight: Option<u16>,
    #[arg(long = "device")]
    pub device: Vec<String>,
    #[arg(long)]
    pub ulimit: Vec<String>,
    #[arg(long)]
    pub shm_size: Option<String>,
    #[arg(long)]
    pub rdt_class: Option<String>,

    #[arg(long)]
    pub privileged: bool,
    #[arg(long)]
    pub cap_add: Vec<String>,
    #[arg(long)]
    pub cap_drop: Vec<String>,
    #[arg(long)]
    pub security_opt: Vec<String>,
    #[arg(long)]
    pub sysctl: Vec<String>,
    /// GPU devices to expose, e.g. all or count=1.
    #[arg(long)]
    pub gpus: Vec<String>,

    /// Bind mount or named volume (src:dst[:opts]).
    #[arg(short, long)]
    pub volume: Vec<String>,
    #[arg(long)]
    pub tmpfs: Vec<String>,
    /// Mount in key=value form (type=bind|volume|tmpfs,...).
    #[arg(long)]
    pub mount: Vec<String>,
    #[arg(long)]
    pub read_only: bool,

    /// json-file, journald, none, or binary://PATH.
    #[arg(long)]
    pub log_driver: Option<String>,
    #[arg(long)]
    pub log_opt: Vec<String>,

    /// Image verification: none or cosign.
    #[arg(long)]
    pub verify: Option<String>,
    #[arg(long)]
    pub cosign_key: Option<String>,
    #[arg(long)]
    pub cosign_certificate_identity: Option<String>,
    #[arg(long)]
    pub cosign_certificate_identity_regexp: Option<String>,
    #[arg(long)]
    pub cosign_certificate_oidc_issuer: Option<String>,
    #[arg(long)]
    pub cosign_certificate_oidc_issuer_regexp: Option<String>,

    #[arg(short, long)]
    pub label: Vec<String>,
    #[arg(long)]
    pub label_file: Vec<PathBuf>,
    /// Write the container id to this file.
    #[arg(long)]
    pub cidfile: Option<PathBuf>,
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Image reference, or a rootfs path with --rootfs.
    pub image: String,
    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    pub fn into_options(self) -> RunOptions {
        RunOptions {
            image: self.image,
            args: self.args,
            tty: self.tty,
            interactive: self.interactive,
            detach: self.detach,
            user: self.user,
            workdir: self.workdir,
            entrypoint: self.entrypoint.map(|e| {
                if e.is_empty() {
                    Vec::new()
                } else {
                    vec![e]
                }
            }),
            env: self.env,
            env_files: self.env_file,
            umask: self.umask,
            group_add: self.group_add,
            init: self.init,
            restart: self.restart.unwrap_or_default(),
            rm: self.rm,
            stop_signal: self.stop_signal.unwrap_or_default(),
            stop_timeout: self.stop_timeout,
            pull: self.pull.unwrap_or_default(),
            platform: self.platform,
            rootfs: self.rootfs,
            networks: self.network,
            ip: self.ip,
            ip6: self.ip6,
            mac_address: self.mac_address,
            hostname: self.hostname,
            domainname: self.domainname,
            dns: self.dns,
            dns_search: self.dns_search,
            dns_opt: self.dns_opt,
            publish: self.publish,
            add_host: self.add_host,
            ipc: self.ipc,
            pid: self.pid,
            uts: self.uts,
            cgroupns: self.cgroupns,
            userns: self.userns,
            cpus: self.cpus,
            cpu_quota: self.cpu_quota,
            cpu_period: self.cpu_period,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus,
            cpuset_mems: self.cpuset_mems,
            memory: self.memory,
            memory_swap: self.memory_swap,
            memory_reservation: self.memory_reservation,
            memory_swappiness: self.memory_swappiness,
            kernel_memory: self.kernel_memory,
            oom_kill_disable: self.oom_kill_disable,
            oom_score_adj: self.oom_score_adj,
            pids_limit: self.pids_limit,
            cgroup_conf: self.cgroup_conf,
            cgroup_parent: self.cgroup_parent,
            blkio_weight: self.blkio_weight,
            devices: self.device,
            ulimits: self.ulimit,
            shm_size: self.shm_size,
            rdt_class: self.rdt_class,
            privileged: self.privileged,
            cap_add: self.cap_add,
            cap_drop: self.cap_drop,
            security_opt: self.security_opt,
            sysctl: self.sysctl,
            gpus: self.gpus,
            volumes: self.volume,
            tmpfs: self.tmpfs,
            mounts: self.mount,
            read_only: self.read_only,
            log_driver: self.log_driver.unwrap_or_default(),
            log_opts: self.log_opt,
            verify: self.verify.unwrap_or_default(),
            cosign_key: self.cosign_key,
            cosign_certificate_identity: self.cosign_certificate_identity,
            cosign_certificate_identity_regexp: self.cosign_certificate_identity_regexp,
            cosign_certificate_oidc_issuer: self.cosign_certificate_oidc_issuer,
            cosign_certificate_oidc_issuer_regexp: self.cosign_certificate_oidc_issuer_regexp,
            name: self.name,
            labels: self.label,
            label_files: self.label_file,
            cidfile: self.cidfile,
            pidfile: self.pidfile,
        }
    }
}

pub fn run(engine: &Engine, args: RunArgs) -> Result<u8, String> {
    let opts = args.into_options();
    match engine.run(&opts).map_err(|e| e.to_string())? {
        RunOutcome::Detached { id } => {
            println!("{id}");
            Ok(EXIT_SUCCESS)
        }
        RunOutcome::Exited { code, .. } => Ok(container_exit_code(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    #[command(args_override_self = true)]
    struct Wrapper {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> RunOptions {
        let argv = std::iter::once("run").chain(args.iter().copied());
        Wrapper::try_parse_from(argv).unwrap().run.into_options()
    }

    #[test]
    fn command_after_image_keeps_its_flags() {
        let o = parse(&["-d", "--name=web", "alpine", "sh", "-c", "echo hi"]);
        assert!(o.detach);
        assert_eq!(o.name.as_deref(), Some("web"));
        assert_eq!(o.image, "alpine");
        assert_eq!(o.args, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn repeated_flags_accumulate() {
        let o = parse(&[
            "-p", "8080:80", "-p=9090:90", "-e", "A=1", "--env=B=2", "--net", "n1",
            "--network=n2", "alpine",
        ]);
        assert_eq!(o.publish, vec!["8080:80", "9090:90"]);
        assert_eq!(o.env, vec!["A=1", "B=2"]);
        assert_eq!(o.networks, vec!["n1", "n2"]);
    }

    #[test]
    fn later_single_value_flag_wins() {
        let o = parse(&["--hostname=svc", "--hostname=custom", "alpine"]);
        assert_eq!(o.hostname.as_deref(), Some("custom"));
    }

    #[test]
    fn empty_entrypoint_clears() {
        assert_eq!(parse(&["--entrypoint=", "alpine"]).entrypoint, Some(Vec::new()));
        assert_eq!(
            parse(&["--entrypoint", "/bin/sh", "alpine"]).entrypoint,
            Some(vec!["/bin/sh".to_owned()])
        );
        assert_eq!(parse(&["alpine"]).entrypoint, None);
    }

    #[test]
    fn negative_numbers_are_values() {
        let o = parse(&["--memory-swap", "-1", "--oom-score-adj", "-500", "alpine"]);
        assert_eq!(o.memory_swap.as_deref(), Some("-1"));
        assert_eq!(o.oom_score_adj, Some(-500));
    }
}
