/// Splits an image reference into the `fromImage`/`tag` pair the pull API
/// expects. Digest references are passed through whole with an empty tag;
/// untagged references pull `latest`.
pub fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    // A colon before the last slash belongs to a registry port.
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, "latest"),
    }
}
