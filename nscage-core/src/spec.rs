//! Textual mount and overlay specs, as accepted by the recipe
//! front-ends.
//!
//! ```text
//! mount-spec   ::= fstype "," device "," mountpoint ("," option)*
//! overlay-spec ::= mountpoint ("," option)*
//! ```
//!
//! `bind,A,B` is shorthand for `,A,B,bind`, `rbind,A,B` for
//! `,A,B,bind,rec`. Commas inside option values may be escaped with a
//! single backslash; the backslash is consumed.

use std::path::PathBuf;

use nix::mount::MsFlags;

use crate::errors::ParseError;
use crate::recipe::{MkdirPolicy, MountStep, OverlayStep};

/// Split on unescaped occurrences of `delim`, consuming the escape
/// backslash.
pub fn split_escaped(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == delim || next == '\\' => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            }
        } else if c == delim {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn flag_for(name: &str) -> Option<MsFlags> {
    let flag = match name {
        "remount" => MsFlags::MS_REMOUNT,
        "move" => MsFlags::MS_MOVE,
        "bind" => MsFlags::MS_BIND,
        "rec" => MsFlags::MS_REC,
        // propagation
        "shared" => MsFlags::MS_SHARED,
        "private" => MsFlags::MS_PRIVATE,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "slave" => MsFlags::MS_SLAVE,
        // read
        "rw" => MsFlags::empty(),
        "ro" => MsFlags::MS_RDONLY,
        // atime
        "noatime" => MsFlags::MS_NOATIME,
        "nodiratime" => MsFlags::MS_NODIRATIME,
        "relatime" => MsFlags::MS_RELATIME,
        "strictatime" => MsFlags::MS_STRICTATIME,
        // filetypes
        "nodev" => MsFlags::MS_NODEV,
        "noexec" => MsFlags::MS_NOEXEC,
        "nosuid" => MsFlags::MS_NOSUID,
        // misc
        "dirsync" => MsFlags::MS_DIRSYNC,
        "lazytime" => MsFlags::MS_LAZYTIME,
        "silent" => MsFlags::MS_SILENT,
        "synchronous" => MsFlags::MS_SYNCHRONOUS,
        "mandlock" => MsFlags::MS_MANDLOCK,
        _ => return None,
    };
    Some(flag)
}

/// Fold shared mount options (flag names, `mkdir=`, passthrough data)
/// into their destinations.
fn apply_options(
    opts: &[String],
    flags: &mut MsFlags,
    mkdir: &mut MkdirPolicy,
    data: &mut Vec<String>,
) -> Result<(), ParseError> {
    for opt in opts {
        if let Some(arg) = opt.strip_prefix("mkdir=") {
            *mkdir = match arg {
                "never" => MkdirPolicy::Never,
                "maybe" => MkdirPolicy::MaybeAll,
                "require" => MkdirPolicy::RequireAll,
                _ => {
                    return Err(ParseError::UnknownMkdirArg {
                        arg: arg.to_string(),
                    });
                }
            };
        } else if let Some(flag) = flag_for(opt) {
            *flags |= flag;
        } else {
            data.push(opt.clone());
        }
    }
    Ok(())
}

/// Parse a `fstype,device,mountpoint[,option...]` mount spec.
pub fn parse_mount_spec(s: &str) -> Result<MountStep, ParseError> {
    let parts = split_escaped(s, ',');
    if parts.len() < 3 {
        return Err(ParseError::IncompleteMountSpec { spec: s.to_string() });
    }

    let mut fstype = parts[0].clone();
    let mut flags = MsFlags::empty();
    if fstype == "bind" {
        flags |= MsFlags::MS_BIND;
        fstype.clear();
    } else if fstype == "rbind" {
        flags |= MsFlags::MS_BIND | MsFlags::MS_REC;
        fstype.clear();
    }

    let mut mkdir = MkdirPolicy::Never;
    let mut data = Vec::new();
    apply_options(&parts[3..], &mut flags, &mut mkdir, &mut data)?;

    Ok(MountStep {
        fstype,
        source: parts[1].clone(),
        target: PathBuf::from(&parts[2]),
        flags,
        data,
        mkdir,
    })
}

/// Parse a `mountpoint[,option...]` overlay spec.
///
/// Lower/upper/work consistency is checked later, when the overlay is
/// resolved into concrete steps.
pub fn parse_overlay_spec(s: &str) -> Result<OverlayStep, ParseError> {
    let parts = split_escaped(s, ',');
    if parts[0].is_empty() {
        return Err(ParseError::IncompleteOverlaySpec { spec: s.to_string() });
    }

    let mut step = OverlayStep {
        target: PathBuf::from(&parts[0]),
        ..OverlayStep::default()
    };

    let mut mount_opts = Vec::new();
    for opt in &parts[1..] {
        if let Some(v) = opt.strip_prefix("lowerdir=") {
            step.lowerdir = Some(v.to_string());
        } else if let Some(v) = opt.strip_prefix("upperdir=") {
            step.upperdir = Some(v.to_string());
        } else if let Some(v) = opt.strip_prefix("workdir=") {
            step.workdir = Some(v.to_string());
        } else if let Some(v) = opt.strip_prefix("copyfrom=") {
            step.copy_from = Some(PathBuf::from(v));
        } else if opt.as_str() == "tmp" {
            step.tmp = true;
        } else if opt.as_str() == "shadow" {
            step.shadow = true;
        } else {
            mount_opts.push(opt.clone());
        }
    }

    apply_options(&mount_opts, &mut step.flags, &mut step.mkdir, &mut step.extra)?;

    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_mount_spec_is_rejected() {
        let err = parse_mount_spec("bind").unwrap_err();
        assert!(err.to_string().starts_with("Incomplete mount spec"));
        assert!(parse_mount_spec("proc,proc").is_err());
    }

    #[test]
    fn bind_shorthand_desugars() {
        let step = parse_mount_spec("bind,/a,/b").unwrap();
        assert_eq!(step.fstype, "");
        assert_eq!(step.source, "/a");
        assert_eq!(step.target, PathBuf::from("/b"));
        assert_eq!(step.flags, MsFlags::MS_BIND);

        let step = parse_mount_spec("rbind,/a,/b").unwrap();
        assert_eq!(step.flags, MsFlags::MS_BIND | MsFlags::MS_REC);
    }

    #[test]
    fn shorthand_matches_longhand() {
        assert_eq!(
            parse_mount_spec("bind,/a,/b").unwrap(),
            parse_mount_spec(",/a,/b,bind").unwrap()
        );
        assert_eq!(
            parse_mount_spec("rbind,/a,/b").unwrap(),
            parse_mount_spec(",/a,/b,bind,rec").unwrap()
        );
    }

    #[test]
    fn flag_names_set_bits_and_rw_is_neutral() {
        let step = parse_mount_spec("tmpfs,tmp,/t,ro,noexec,nosuid,nodev").unwrap();
        assert_eq!(
            step.flags,
            MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV
        );
        let step = parse_mount_spec("tmpfs,tmp,/t,rw").unwrap();
        assert_eq!(step.flags, MsFlags::empty());
    }

    #[test]
    fn unknown_options_pass_through_as_data() {
        let step = parse_mount_spec("tmpfs,tmp,/t,size=64m,mode=755").unwrap();
        assert_eq!(step.data, vec!["size=64m", "mode=755"]);
    }

    #[test]
    fn mkdir_modes_parse_and_bad_arg_is_rejected() {
        assert_eq!(
            parse_mount_spec("tmpfs,tmp,/t,mkdir=never").unwrap().mkdir,
            MkdirPolicy::Never
        );
        assert_eq!(
            parse_mount_spec("tmpfs,tmp,/t,mkdir=maybe").unwrap().mkdir,
            MkdirPolicy::MaybeAll
        );
        assert_eq!(
            parse_mount_spec("tmpfs,tmp,/t,mkdir=require").unwrap().mkdir,
            MkdirPolicy::RequireAll
        );
        assert_eq!(
            parse_mount_spec("tmpfs,tmp,/t,mkdir=sometimes").unwrap_err(),
            ParseError::UnknownMkdirArg {
                arg: "sometimes".into()
            }
        );
    }

    #[test]
    fn escaped_commas_stay_inside_values() {
        let parts = split_escaped(r"a,b\,c,d", ',');
        assert_eq!(parts, vec!["a", "b,c", "d"]);
        let parts = split_escaped(r"a\\,b", ',');
        assert_eq!(parts, vec![r"a\", "b"]);

        let step = parse_mount_spec(r"tmpfs,tmp,/t,context=a\,b").unwrap();
        assert_eq!(step.data, vec!["context=a,b"]);
    }

    #[test]
    fn overlay_spec_extracts_options() {
        let step =
            parse_overlay_spec("/opt/app,lowerdir=/base,upperdir=/up,workdir=/work,nodev")
                .unwrap();
        assert_eq!(step.target, PathBuf::from("/opt/app"));
        assert_eq!(step.lowerdir.as_deref(), Some("/base"));
        assert_eq!(step.upperdir.as_deref(), Some("/up"));
        assert_eq!(step.workdir.as_deref(), Some("/work"));
        assert_eq!(step.flags, MsFlags::MS_NODEV);
        assert!(!step.tmp);
        assert!(!step.shadow);
    }

    #[test]
    fn overlay_tmp_shadow_copyfrom_flags() {
        let step = parse_overlay_spec("/opt/app,tmp,shadow,copyfrom=/seed").unwrap();
        assert!(step.tmp);
        assert!(step.shadow);
        assert_eq!(step.copy_from, Some(PathBuf::from("/seed")));
    }

    #[test]
    fn overlay_without_mountpoint_is_rejected() {
        assert_eq!(
            parse_overlay_spec("").unwrap_err(),
            ParseError::IncompleteOverlaySpec { spec: String::new() }
        );
        assert!(parse_overlay_spec(",lowerdir=/x").is_err());
    }

    #[test]
    fn overlay_passthrough_options_are_kept() {
        let step = parse_overlay_spec("/opt/app,shadow,xino=off").unwrap();
        assert_eq!(step.extra, vec!["xino=off"]);
    }
}
