use super::models::NodeRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("quota exceeded")]
pub struct QuotaExceeded;

/// Checks whether the space root has room for `new_size` bytes.
///
/// When `overwrite` is set the file replaces an existing one of `old_size` bytes, so the
/// old size is given back before the new size is accounted. Otherwise `old_size` is ignored.
pub fn check_quota(
    space_root: &NodeRecord,
    overwrite: bool,
    old_size: u64,
    new_size: u64,
) -> Result<(), QuotaExceeded> {
    let quota = match space_root.quota {
        None | Some(0) => return Ok(()),
        Some(q) => q,
    };
    let used = space_root.tree_size;

    if overwrite {
        if quota < used.saturating_sub(old_size).saturating_add(new_size) {
            return Err(QuotaExceeded);
        }
    } else if quota < used || new_size > quota - used {
        return Err(QuotaExceeded);
    }
    Ok(())
}
