//! Synthesis of the worker pod backing one polecat.
//!
//! The pod is never user-authored: one init container clones the rig's
//! repository over SSH into a scratch volume, one main container runs the
//! agent image against that checkout. Host keys for the major forges are
//! baked into the binary and injected so the clone runs with strict
//! host-key checking.

use crate::{
    apis::polecat_types::Polecat,
    controller::{LABEL_BEAD, LABEL_POLECAT, LABEL_RIG},
    defaults::{default_agent_image, default_clone_image, default_workspace_path},
    Error, Result,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec,
    SeccompProfile, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use kube::{api::ObjectMeta, Resource, ResourceExt};
use std::collections::BTreeMap;

pub const MANAGED_BY: &str = "gastown-operator";

const WORKSPACE_VOLUME: &str = "workspace";
const SSH_RUNTIME_VOLUME: &str = "ssh-runtime";
const GIT_SECRET_VOLUME: &str = "git-credentials";
const MODEL_SECRET_VOLUME: &str = "model-credentials";

const GIT_SECRET_PATH: &str = "/etc/gastown/git";
const MODEL_SECRET_PATH: &str = "/etc/gastown/claude";

/// Host keys for the major forges, verified against the providers'
/// published fingerprints. Cloning from any host absent here fails before
/// a connection is attempted with credentials.
pub const KNOWN_HOSTS: &str = "\
github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl
github.com ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBEmKSENjQEezOmxkZMy7opKgwFB9nkt5YRrYMjNuG5N87uRgg6CLrbo5wAdT/y6v0mKV0U2w0WZ2YB/++Tpockg=
gitlab.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf
gitlab.com ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBFSMqzJeV9rUzU4kWitGjeR4PWSa29SPqJ1fVkhtj3Hw9xjLVXVYrU9QlYWrOLXBpQ6KWjbjTDTdDkoohFzgbEY=
bitbucket.org ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIazEu89wgQZ4bqs3d63QSMzYVa0MuJ2e2gKTKqu+UUO
codeberg.org ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIVIC02vnjFyL+I4RHfvIGNtOgJMe769VTF1VR4EB3ZB
";

// The bootstrap writes the baked known-hosts file and the 0600 key copy
// into the ssh scratch mount, then clones into the workspace. The root
// filesystem is read-only, so both live on emptyDir volumes.
const CLONE_SCRIPT: &str = r#"set -e
printf '%s' "$GIT_KNOWN_HOSTS" > /ssh/known_hosts
for key in ssh-privatekey id_rsa id_ed25519 identity; do
    if [ -f "/etc/gastown/git/$key" ]; then
        install -m 0600 "/etc/gastown/git/$key" /ssh/key
        break
    fi
done
test -f /ssh/key
export GIT_SSH_COMMAND="ssh -i /ssh/key -o UserKnownHostsFile=/ssh/known_hosts -o StrictHostKeyChecking=yes -o IdentitiesOnly=yes"
if [ -n "$GIT_BASE_BRANCH" ]; then
    git clone --branch "$GIT_BASE_BRANCH" --single-branch "$GIT_REPOSITORY" "$WORKSPACE"
else
    git clone "$GIT_REPOSITORY" "$WORKSPACE"
fi
cd "$WORKSPACE"
git checkout -B "$WORK_BRANCH"
"#;

pub fn pod_name(polecat: &Polecat) -> String {
    format!("polecat-{}", polecat.name_any())
}

/// Branch the worker commits to, recorded in status for the Refinery.
pub fn work_branch(polecat: &Polecat) -> String {
    polecat
        .spec
        .kubernetes
        .as_ref()
        .and_then(|k| k.gitBranch.clone())
        .unwrap_or_else(|| format!("polecat/{}", polecat.name_any()))
}

pub fn worker_labels(polecat: &Polecat) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_POLECAT.to_owned(), polecat.name_any()),
        (LABEL_RIG.to_owned(), polecat.spec.rig.clone()),
        (LABEL_BEAD.to_owned(), polecat.spec.beadID.clone()),
        ("managed-by".to_owned(), MANAGED_BY.to_owned()),
    ])
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        run_as_user: Some(1000),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_owned()]),
            ..Capabilities::default()
        }),
        ..SecurityContext::default()
    }
}

pub fn worker_pod_from_polecat(polecat: &Polecat) -> Result<Pod> {
    let kubernetes = polecat
        .spec
        .kubernetes
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("polecat has no kubernetes template".to_owned()))?;
    let ns = polecat
        .namespace()
        .ok_or_else(|| Error::InvalidSpec("polecat is not namespaced".to_owned()))?;
    let oref = polecat
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidSpec("polecat has no name".to_owned()))?;

    let workspace = kubernetes
        .workspacePath
        .clone()
        .unwrap_or_else(default_workspace_path);
    let image = kubernetes.agentImage.clone().unwrap_or_else(default_agent_image);
    let labels = worker_labels(polecat);

    let workspace_mount = VolumeMount {
        name: WORKSPACE_VOLUME.to_owned(),
        mount_path: workspace.clone(),
        ..VolumeMount::default()
    };

    let init_env = vec![
        EnvVar {
            name: "GIT_REPOSITORY".to_owned(),
            value: Some(kubernetes.gitRepository.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "GIT_BASE_BRANCH".to_owned(),
            value: kubernetes.gitBranch.clone(),
            ..EnvVar::default()
        },
        EnvVar {
            name: "WORK_BRANCH".to_owned(),
            value: Some(work_branch(polecat)),
            ..EnvVar::default()
        },
        EnvVar {
            name: "WORKSPACE".to_owned(),
            value: Some(workspace.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "GIT_KNOWN_HOSTS".to_owned(),
            value: Some(KNOWN_HOSTS.to_owned()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "HOME".to_owned(),
            value: Some(workspace.clone()),
            ..EnvVar::default()
        },
    ];

    let init_container = Container {
        name: "fetch-workspace".to_owned(),
        image: Some(default_clone_image()),
        command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned(), CLONE_SCRIPT.to_owned()]),
        env: Some(init_env),
        volume_mounts: Some(vec![
            workspace_mount.clone(),
            VolumeMount {
                name: SSH_RUNTIME_VOLUME.to_owned(),
                mount_path: "/ssh".to_owned(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: GIT_SECRET_VOLUME.to_owned(),
                mount_path: GIT_SECRET_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ]),
        security_context: Some(container_security_context()),
        ..Container::default()
    };

    let agent_container = Container {
        name: "agent".to_owned(),
        image: Some(image),
        env: Some(vec![
            EnvVar {
                name: "POLECAT_NAME".to_owned(),
                value: Some(polecat.name_any()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "RIG".to_owned(),
                value: Some(polecat.spec.rig.clone()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "BEAD_ID".to_owned(),
                value: Some(polecat.spec.beadID.clone()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "WORKSPACE".to_owned(),
                value: Some(workspace.clone()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "CLAUDE_CREDENTIALS_PATH".to_owned(),
                value: Some(MODEL_SECRET_PATH.to_owned()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "HOME".to_owned(),
                value: Some(workspace),
                ..EnvVar::default()
            },
        ]),
        volume_mounts: Some(vec![
            workspace_mount,
            VolumeMount {
                name: MODEL_SECRET_VOLUME.to_owned(),
                mount_path: MODEL_SECRET_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ]),
        security_context: Some(container_security_context()),
        ..Container::default()
    };

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(polecat)),
            namespace: Some(ns),
            labels: Some(labels),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            // The worker runs to completion exactly once; pod phase is the
            // lifecycle signal, so restarts would mask failure.
            restart_policy: Some("Never".to_owned()),
            init_containers: Some(vec![init_container]),
            containers: vec![agent_container],
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_owned(),
                    ..SeccompProfile::default()
                }),
                ..PodSecurityContext::default()
            }),
            volumes: Some(vec![
                Volume {
                    name: WORKSPACE_VOLUME.to_owned(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Volume::default()
                },
                Volume {
                    name: SSH_RUNTIME_VOLUME.to_owned(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Volume::default()
                },
                Volume {
                    name: GIT_SECRET_VOLUME.to_owned(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(kubernetes.gitSecretRef.clone()),
                        default_mode: Some(0o400),
                        ..SecretVolumeSource::default()
                    }),
                    ..Volume::default()
                },
                Volume {
                    name: MODEL_SECRET_VOLUME.to_owned(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(kubernetes.claudeCredsSecretRef.clone()),
                        default_mode: Some(0o400),
                        ..SecretVolumeSource::default()
                    }),
                    ..Volume::default()
                },
            ]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    };
    Ok(pod)
}
