use crate::consts::HEAD;

/// True if `value` is a full 40 character lowercase hexadecimal Git hash.
pub fn is_git_commit(value: &str) -> bool {
  value.len() == 40 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// True for a Git hash or the symbolic `HEAD`.
pub fn is_commit_or_head(value: &str) -> bool {
  value == HEAD || is_git_commit(value)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_full_hash() {
    assert!(is_git_commit("a5dde1b7a1ce00a0f1d6c6c0d7b4a51d0ad6b3e1"));
  }

  #[test]
  fn rejects_short_upper_and_refs() {
    assert!(!is_git_commit("a5dde1b"));
    assert!(!is_git_commit("A5DDE1B7A1CE00A0F1D6C6C0D7B4A51D0AD6B3E1"));
    assert!(!is_git_commit("main"));
    assert!(!is_git_commit(""));
  }

  #[test]
  fn head_is_allowed_separately() {
    assert!(!is_git_commit(HEAD));
    assert!(is_commit_or_head(HEAD));
  }
}
