use voxstream_sdf::{Dims, seed_from_mask, squared_edt_3d};

#[test]
fn crate_root_exposes_the_transform() {
    // One row along X: solid, empty, empty, empty, solid.
    let dims = Dims::new(5, 1, 1);
    let mask = [true, false, false, false, true];
    let mut field = seed_from_mask(&mask, true);
    squared_edt_3d(&mut field, dims, [1.0; 3]);
    assert_eq!(field, vec![0.0, 1.0, 4.0, 1.0, 0.0]);
}
