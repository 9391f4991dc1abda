use crate::capture::SourceDescriptor;

/// Resolve possible input addresses for a given device format name.
fn inputs_for_format(format_name: &str) -> Vec<String> {
    match format_name {
        #[cfg(target_os = "linux")]
        "v4l2" => v4l2_device_paths()
            .map(|paths| {
                paths
                    .into_iter()
                    .filter_map(|p| p.into_os_string().into_string().ok())
                    .collect()
            })
            .unwrap_or_default(),
        #[cfg(not(target_os = "linux"))]
        "v4l2" => Vec::new(),
        "lavfi" => vec![
            "testsrc2=size=1280x720:rate=30".to_string(),
            "smptehdbars=size=1920x1080:rate=30".to_string(),
        ],
        _ => Vec::new(),
    }
}

#[cfg(target_os = "linux")]
pub fn v4l2_device_paths() -> std::io::Result<Vec<std::path::PathBuf>> {
    use std::path::PathBuf;
    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev")?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|s| s.starts_with("video"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Every enumerable input of every ffmpeg video input device.
pub fn discover_sources() -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();
    for device in ffmpeg_next::device::input::video() {
        let format = device.name().to_string();
        for input in inputs_for_format(&format) {
            sources.push(SourceDescriptor {
                name: format!("{} ({})", input, device.description()),
                url: input,
                format: Some(format.clone()),
            });
        }
    }
    log::debug!("discovered {} sources", sources.len());
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lavfi_sources_are_listed() {
        let inputs = inputs_for_format("lavfi");
        assert_eq!(inputs.len(), 2);
        assert!(inputs_for_format("x11grab").is_empty());
    }

    #[test]
    fn test_discovered_sources_carry_format() -> anyhow::Result<()> {
        crate::init()?;
        for source in discover_sources() {
            assert!(source.format.is_some());
            assert!(!source.url.is_empty());
        }
        Ok(())
    }
}
