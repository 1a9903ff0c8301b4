use proptest::prelude::*;
use update_fs::NormalizedPath;

proptest! {
    #[test]
    fn normalized_paths_have_no_backslashes(s in "\\PC*") {
        let path = NormalizedPath::new(&s);
        prop_assert!(!path.as_str().contains('\\'));
    }

    #[test]
    fn suffix_is_reversible(s in "[a-z][a-z0-9_./]{0,30}[a-z0-9]") {
        let path = NormalizedPath::new(&s);
        let temp = path.with_suffix(".tmp");
        prop_assert_eq!(temp.strip_suffix(".tmp"), Some(path));
    }
}
