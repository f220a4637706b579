use image_pipeline::resize::{Precision, Rect, Scale, Size, map};
use proptest::prelude::*;

fn size() -> impl Strategy<Value = Size> {
    (1u32..4000, 1u32..4000).prop_map(|(w, h)| Size::new(w, h))
}

fn scale() -> impl Strategy<Value = Scale> {
    prop_oneof![
        Just(Scale::StartCrop),
        Just(Scale::CenterCrop),
        Just(Scale::EndCrop),
        Just(Scale::Fill),
    ]
}

fn inside(rect: Rect, image: Size) -> bool {
    rect.left <= rect.right && rect.top <= rect.bottom && rect.right <= image.width && rect.bottom <= image.height
}

proptest! {
    #[test]
    fn exact_always_produces_target_and_in_bounds_src(image in size(), target in size(), scale in scale()) {
        let mapping = map(image, target, Precision::Exact, scale).expect("mapping");
        prop_assert_eq!(mapping.dest, Rect::from_size(target));
        prop_assert!(inside(mapping.src, image));
        prop_assert!(mapping.src.width() >= 1 && mapping.src.height() >= 1);
    }

    #[test]
    fn crop_src_touches_image_edges(image in size(), target in size()) {
        let start = map(image, target, Precision::Exact, Scale::StartCrop).expect("mapping");
        let end = map(image, target, Precision::Exact, Scale::EndCrop).expect("mapping");
        prop_assert_eq!((start.src.left, start.src.top), (0, 0));
        prop_assert_eq!((end.src.right, end.src.bottom), (image.width, image.height));
        // 裁剪只在一个方向上发生
        prop_assert!(start.src.width() == image.width || start.src.height() == image.height);
    }

    #[test]
    fn fill_uses_whole_image(image in size(), target in size()) {
        let mapping = map(image, target, Precision::Exact, Scale::Fill).expect("mapping");
        prop_assert_eq!(mapping.src, Rect::from_size(image));
    }

    #[test]
    fn less_pixels_never_exceeds_target_area_or_upscales(image in size(), target in size(), scale in scale()) {
        let mapping = map(image, target, Precision::LessPixels, scale).expect("mapping");
        let dest = mapping.dest.size();
        prop_assert_eq!(mapping.src, Rect::from_size(image));
        prop_assert!(dest.width <= image.width && dest.height <= image.height);
        prop_assert!(dest.pixels() <= target.pixels() || dest == Size::new(1, 1) || image == target);
    }

    #[test]
    fn smaller_size_fits_both_sides(image in size(), target in size(), scale in scale()) {
        let mapping = map(image, target, Precision::SmallerSize, scale).expect("mapping");
        let dest = mapping.dest.size();
        prop_assert!(dest.width <= image.width && dest.height <= image.height);
        prop_assert!(dest.width <= target.width && dest.height <= target.height);
    }
}

#[test]
fn degenerate_inputs_yield_none() {
    assert!(map(Size::new(0, 0), Size::new(10, 10), Precision::Exact, Scale::Fill).is_none());
    assert!(map(Size::new(10, 10), Size::new(0, 3), Precision::SmallerSize, Scale::Fill).is_none());
}
